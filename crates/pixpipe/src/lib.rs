//! pixpipe: a small pixel pipeline evaluated through [`pixpipe_cache`].
//!
//! A [`Pipe`] holds a source image and an ordered list of [`Node`]s.
//! [`Pipe::process`] renders the source at a region of interest,
//! reusing every node output the cache still holds and recomputing the
//! rest. Interactive editing (moving a slider, toggling a node, panning)
//! then only pays for the nodes downstream of the change.
//!
//! ```rust
//! # use pixpipe::{Node, Operator, Pipe, PipeError};
//! # use pixpipe_cache::{PipeType, Roi};
//! # fn run() -> Result<(), PipeError> {
//! let source = pixpipe::test_card(64, 48);
//! let mut pipe = Pipe::with_preset(PipeType::Preview, source, 1, 0)?
//!     .with_node(Node::new(1, "exposure", Operator::Exposure { ev: 0.3 }))
//!     .with_node(Node::new(2, "blur", Operator::GaussianBlur { sigma: 1.0 }));
//!
//! let roi = Roi::full(64, 48, 1.0);
//! pipe.process(&roi)?;
//! pipe.set_params(1, Operator::GaussianBlur { sigma: 2.0 })?;
//! let out = pipe.process(&roi)?;
//! assert_eq!(out.stats.computed, ["blur"]);
//! # Ok(())
//! # }
//! ```

pub mod input;
pub mod node;
pub mod ops;
pub mod picker;
pub mod pipe;
pub mod types;

pub use input::{decode_source, render_roi, source_window, test_card};
pub use node::Node;
pub use ops::Operator;
pub use picker::sample_mean;
pub use pipe::{Pipe, preset_for};
pub use types::{PassStats, PipeError, PipeOutput, Rgba32FImage};

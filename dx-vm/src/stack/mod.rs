//! Frames, fragments and the walker that visits them.

pub mod frame_layout;
pub mod instrumentation;
pub mod managed_stack;
pub mod memory;
pub mod shadow_frame;
pub mod walker;

pub use managed_stack::{FragmentTop, ManagedStack};
pub use shadow_frame::{ReferenceLayout, ShadowFrame};
pub use walker::{StackVisitor, compute_num_frames, describe_stack};

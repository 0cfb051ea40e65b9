//! Display module for formatted CLI output

pub mod colors;
pub mod format;
pub mod icons;
pub mod table;

pub use colors::StatePalette;
pub use format::{render_plan, OutputFormat};
pub use icons::StatusIcon;
pub use table::TableRenderer;

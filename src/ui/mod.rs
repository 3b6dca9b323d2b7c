//! Terminal presentation for the CLI: icons, styled output, progress
//! bars and metric tables.

pub mod icons;
pub mod output;
pub mod progress;
pub mod table;

pub use icons::Icons;
pub use output::{error, file_deleted, header, human_bytes, section, status, success, summary_row};
pub use progress::{MigrationBar, Spinner};
pub use table::stats_table;

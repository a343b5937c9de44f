//! Terminal output: live wave progress and the end-of-run report.

pub mod events;
pub mod icons;
pub mod report;

pub use events::EventPrinter;
pub use report::{format_duration, print_plan, print_report, print_status};

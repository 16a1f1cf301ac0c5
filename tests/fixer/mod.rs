//! Resolution engine scenarios.

mod end_to_end;
mod failures;
mod output;

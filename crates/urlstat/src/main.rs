//! urlstat.
//!
//! urlstat reads URLs line by line and prints how often a pattern occurs in the document behind
//! each of them. A bounded number of documents is downloaded at the same time, and every distinct
//! URL is downloaded only once, no matter how often it is listed.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cli;
mod input;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}

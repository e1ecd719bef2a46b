//! dpsrv - collaborative drawing session server
//!
//! Thin wrapper so `cargo install dpsrv` provides the server binary.
//! See [`dpsrvd::cli`] for usage.

fn main() -> anyhow::Result<()> {
    dpsrvd::cli::main()
}

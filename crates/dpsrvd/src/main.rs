//! dpsrv server binary. See [`dpsrvd::cli`] for usage.

fn main() -> anyhow::Result<()> {
    dpsrvd::cli::main()
}

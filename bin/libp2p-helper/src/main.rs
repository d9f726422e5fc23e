//! Main entry point for the libp2p helper.

mod cli;

fn main() {
    if let Err(err) = cli::Cli::parse_args().run() {
        eprintln!("Error: {err:?}");
        std::process::exit(1);
    }
}

use std::process::ExitCode;

use clap::Parser;

fn main() -> ExitCode {
    let cli = bench_ranker_cli::Cli::parse();
    bench_ranker_cli::init_tracing();
    match bench_ranker_cli::run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let envelope = bench_ranker_cli::error_envelope(&err);
            eprintln!("{envelope}");
            ExitCode::FAILURE
        }
    }
}

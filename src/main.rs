use std::process::ExitCode;

fn main() -> ExitCode {
    pipewright::cli::init_tracing();
    pipewright::cli::run()
}

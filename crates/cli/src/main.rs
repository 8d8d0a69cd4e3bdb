use std::process::ExitCode;

fn main() -> ExitCode {
    ragway_cli::run()
}

use std::process::ExitCode;

fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    cbag_cli::run()
}

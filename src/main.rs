use partyledger::core::error::ErrorKind;
use std::process::ExitCode;

fn main() -> ExitCode {
    match partyledger::run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => match e.kind() {
            ErrorKind::Internal => ExitCode::from(2),
            _ => ExitCode::from(1),
        },
    }
}

use std::process::ExitCode;

fn main() -> ExitCode {
    aion_dps_meter_lib::run()
}

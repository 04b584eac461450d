use clap::{value_parser, Arg, ArgAction, ArgMatches, Command, ValueEnum};
use log::info;
use simplelog::{ConfigBuilder, LevelFilter, LevelPadding, WriteLogger};
use std::fs::{self, File};
use std::time::Duration;
use time::macros::format_description;

use chrysalis_installer::{RunOutcome, SECTOR_SIZE};

const IMAGE_PATH: &str = "IMAGE_PATH";
const DWELL: &str = "dwell";
const LOG_PATH: &str = "log";
const LOG_LEVEL: &str = "log-level";

const IMAGE_MSG: &str = "\
The installer needs a disk image to stand in for the target disk on the\n\
secondary IDE channel. The image must be a regular file whose size is a\n\
positive multiple of 512 bytes.";

/// Possible log levels.
#[derive(Debug, PartialEq, Eq, Copy, Clone, ValueEnum)]
enum LogLevel {
    TRACE,
    DEBUG,
    INFO,
}

fn cli() -> Command {
    // Hack to make the build dirty when the toml changes.
    include_str!("../../Cargo.toml");

    clap::command!()
        .max_term_width(100)
        .after_help("\
This is the Chrysalis OS system installer, run against a simulated target \
disk. Point it at a disk image and it will carry out the full provisioning \
sequence: detect the disk, format it, copy the system payload, and install \
the boot record. The run stops permanently at the first failing step.")
        .arg(Arg::new(IMAGE_PATH)
            .help("The path to the disk image standing in for the target disk.")
            .action(ArgAction::Set)
            .required(true))
        .arg(Arg::new(DWELL)
            .help("Seconds to wait after a successful install before \
                   requesting the reboot.")
            .short('d')
            .long("dwell")
            .action(ArgAction::Set)
            .default_value("5")
            .value_parser(value_parser!(u64)))
        .arg(Arg::new(LOG_PATH)
            .help("If set, a debug log will be written to the given path.")
            .short('l')
            .long("log")
            .action(ArgAction::Set))
        .arg(Arg::new(LOG_LEVEL)
            .help("Set the log level. Has no effect without specifying \
                   --log as well. Case insensitive.")
            .short('L')
            .long("log-level")
            .action(ArgAction::Set)
            .default_value("trace")
            .value_parser(value_parser!(LogLevel))
            .ignore_case(true))
}

/// Ensure that the given path is a usable disk image.
fn check_image(path: &str) -> Result<(), String> {
    match fs::metadata(path) {
        Ok(meta) => {
            if !meta.is_file() {
                Err(format!("'{}' is not a regular file.\n\n{}", path, IMAGE_MSG))
            } else if meta.len() == 0 || meta.len() % SECTOR_SIZE as u64 != 0 {
                Err(format!("'{}' is not a whole number of sectors.\n\n{}", path, IMAGE_MSG))
            } else {
                Ok(())
            }
        }
        Err(e) => Err(format!("Could not access '{}': {}\n\n{}", path, e, IMAGE_MSG)),
    }
}

/// Initialise logging to the given file.
fn init_logging(logfile: File, level: LevelFilter) {
    let config = ConfigBuilder::new()
        .set_level_padding(LevelPadding::Right)
        .set_location_level(LevelFilter::Off)
        .set_target_level(LevelFilter::Off)
        .set_thread_level(LevelFilter::Off)
        .set_time_format_custom(format_description!(
            "[hour]:[minute]:[second].[subsecond digits:6]"
        ))
        .build();

    WriteLogger::init(level, config, logfile).unwrap();
}

/// Main run function; returns an exit code.
fn run(args: ArgMatches) -> u8 {
    return match _run(args) {
        Ok(RunOutcome::Complete) => 0,
        Ok(RunOutcome::Failed(_)) => 1,
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    };

    fn _run(args: ArgMatches) -> Result<RunOutcome, String> {
        // Ensure the disk image is usable.
        let image_path = args.get_one::<String>(IMAGE_PATH).unwrap();
        check_image(image_path)?;

        // Initialise logging if configured.
        if let Some(log_path) = args.get_one::<String>(LOG_PATH) {
            match File::create(log_path) {
                Ok(logfile) => {
                    let level = match args.get_one::<LogLevel>(LOG_LEVEL).unwrap() {
                        LogLevel::TRACE => LevelFilter::Trace,
                        LogLevel::DEBUG => LevelFilter::Debug,
                        LogLevel::INFO => LevelFilter::Info,
                    };
                    init_logging(logfile, level);
                }
                Err(e) => return Err(format!("Failed to create log file: {}", e)),
            }
        }

        let dwell = Duration::from_secs(*args.get_one::<u64>(DWELL).unwrap());
        info!("Installing to '{}'.", image_path);

        // Run the installer.
        chrysalis_installer::run(image_path, dwell)
    }
}

fn main() {
    let args = cli().get_matches();
    std::process::exit(run(args).into());
}

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! invoke {
        ($($args:expr),+) => {{
            let args = cli().try_get_matches_from(
                    vec!["chrysalis-install".to_string(), $($args.to_string()),*])
                .unwrap();
            run(args)
        }}
    }

    /// Create a blank image of the given sector count and return its path.
    fn blank_image(dir: &tempfile::TempDir, sectors: u64) -> std::path::PathBuf {
        let path = dir.path().join("disk.img");
        let file = fs::File::create(&path).unwrap();
        file.set_len(sectors * SECTOR_SIZE as u64).unwrap();
        path
    }

    /// A full run against a valid image succeeds and leaves the boot
    /// signature in the first sector.
    #[test]
    fn test_install_end_to_end() {
        let tempdir = tempfile::tempdir().unwrap();
        let image = blank_image(&tempdir, 16);
        let ret = invoke!(image.to_str().unwrap(), "--dwell", "0");
        assert_eq!(ret, 0);

        let contents = fs::read(&image).unwrap();
        assert_eq!(&contents[510..512], &[0x55, 0xAA]);
    }

    /// A missing image is a startup error, not an installation failure.
    #[test]
    fn test_missing_image_rejected() {
        let tempdir = tempfile::tempdir().unwrap();
        let bogus = tempdir.path().join("nope.img");
        let ret = invoke!(bogus.to_str().unwrap(), "--dwell", "0");
        assert_eq!(ret, 1);
    }

    /// An image that is not a whole number of sectors is rejected.
    #[test]
    fn test_ragged_image_rejected() {
        let tempdir = tempfile::tempdir().unwrap();
        let path = tempdir.path().join("ragged.img");
        let file = fs::File::create(&path).unwrap();
        file.set_len(SECTOR_SIZE as u64 + 1).unwrap();
        let ret = invoke!(path.to_str().unwrap(), "--dwell", "0");
        assert_eq!(ret, 1);
    }
}

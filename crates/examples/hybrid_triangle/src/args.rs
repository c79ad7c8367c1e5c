use std::ffi::OsString;

use clap::Parser;

pub const DEFAULT_WIDTH: u32 = 1280;
pub const DEFAULT_HEIGHT: u32 = 720;

const WIDTH_FLAGS: [&str; 2] = ["-w", "--width"];
const HEIGHT_FLAGS: [&str; 2] = ["-h", "--height"];

/// Window size. `-h` is the height, so there is no short help flag.
#[derive(Parser, Debug, Clone, Copy, PartialEq, Eq)]
#[clap(disable_help_flag = true, args_override_self = true)]
pub struct Args {
    /// Client area width in pixels
    #[clap(short, long, value_parser = clap::value_parser!(u32).range(1..), default_value_t = DEFAULT_WIDTH)]
    pub width: u32,

    /// Client area height in pixels
    #[clap(short, long, value_parser = clap::value_parser!(u32).range(1..), default_value_t = DEFAULT_HEIGHT)]
    pub height: u32,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
        }
    }
}

impl Args {
    pub fn from_env() -> Self {
        Self::parse_lenient(std::env::args_os())
    }

    /// Unknown arguments are ignored and malformed sizes fall back to their
    /// default with a warning.
    pub fn parse_lenient<I, T>(args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        let mut args = args.into_iter().map(Into::into);
        let program = args.next().unwrap_or_else(|| OsString::from("hybrid-triangle"));
        let args = args.collect::<Vec<_>>();

        let width = parse_dimension(&program, &args, &WIDTH_FLAGS)
            .map(|a| a.width)
            .unwrap_or(DEFAULT_WIDTH);
        let height = parse_dimension(&program, &args, &HEIGHT_FLAGS)
            .map(|a| a.height)
            .unwrap_or(DEFAULT_HEIGHT);

        Self { width, height }
    }
}

/// Parses only the occurrences of one option so a bad value for one does not
/// discard the other.
fn parse_dimension(program: &OsString, args: &[OsString], flags: &[&str]) -> Option<Args> {
    let selected = select_option(args, flags);
    if selected.is_empty() {
        return None;
    }

    match Args::try_parse_from(std::iter::once(program.clone()).chain(selected)) {
        Ok(args) => Some(args),
        Err(e) => {
            log::warn!("Ignoring malformed {}: {:?}", flags[1], e.kind());
            None
        }
    }
}

/// Keeps `flag value` pairs and `--flag=value` forms for the given flags.
fn select_option(args: &[OsString], flags: &[&str]) -> Vec<OsString> {
    let mut selected = vec![];
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        let Some(text) = arg.to_str() else {
            continue;
        };

        if flags.contains(&text) {
            selected.push(arg.clone());
            if let Some(value) = iter.next() {
                selected.push(value.clone());
            }
        } else if flags
            .iter()
            .any(|f| f.starts_with("--") && text.starts_with(&format!("{f}=")))
        {
            selected.push(arg.clone());
        }
    }

    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::parse_lenient(std::iter::once("hybrid-triangle").chain(args.iter().copied()))
    }

    #[test]
    fn defaults_without_arguments() {
        assert_eq!(parse(&[]), Args::default());
        assert_eq!(parse(&[]).width, 1280);
        assert_eq!(parse(&[]).height, 720);
    }

    #[test]
    fn short_and_long_overrides() {
        assert_eq!(
            parse(&["-w", "800", "--height", "600"]),
            Args {
                width: 800,
                height: 600
            }
        );
        assert_eq!(
            parse(&["--width=1024", "-h", "576"]),
            Args {
                width: 1024,
                height: 576
            }
        );
    }

    #[test]
    fn unknown_arguments_are_ignored() {
        assert_eq!(
            parse(&["--fullscreen", "-w", "640", "scene.gltf", "-x", "3"]),
            Args {
                width: 640,
                height: DEFAULT_HEIGHT
            }
        );
    }

    #[test]
    fn malformed_values_fall_back_per_dimension() {
        assert_eq!(
            parse(&["-w", "wide", "-h", "480"]),
            Args {
                width: DEFAULT_WIDTH,
                height: 480
            }
        );
        assert_eq!(parse(&["--height", "0"]), Args::default());
        assert_eq!(parse(&["-w"]), Args::default());
    }

    #[test]
    fn last_occurrence_wins() {
        assert_eq!(parse(&["-w", "100", "-w", "200"]).width, 200);
    }
}

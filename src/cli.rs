use std::path::PathBuf;

use crate::samples::SampleKind;
use crate::{Error, Result};

pub const DEFAULT_WIDTH: u32 = 1280;
pub const DEFAULT_HEIGHT: u32 = 720;
pub const DEFAULT_HEADLESS_FRAMES: u32 = 3;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cli {
    /// Enables the D3D12 debug layer and GPU-based validation.
    pub validation: bool,
    /// Uses the software rasterizer adapter.
    pub warp: bool,
    /// Allocates a console window for log output.
    pub console: bool,
    pub headless: bool,
    pub sample: SampleKind,
    pub shaders: Option<PathBuf>,
    pub frames: u32,
    pub width: u32,
    pub height: u32,
    /// Unrecognized arguments, reported once logging is up.
    pub ignored: Vec<String>,
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            validation: false,
            warp: false,
            console: false,
            headless: false,
            sample: SampleKind::Basic,
            shaders: None,
            frames: DEFAULT_HEADLESS_FRAMES,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            ignored: Vec::new(),
        }
    }
}

impl Cli {
    pub fn from_env() -> Result<Self> {
        Self::parse(std::env::args().skip(1))
    }

    /// Parses flags; `args` must not include the program name.
    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut cli = Cli::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            let arg = arg.as_ref();
            let mut value = |flag: &str| {
                args.next()
                    .map(|value| value.as_ref().to_owned())
                    .ok_or_else(|| Error::Usage(format!("`{flag}` expects a value")))
            };

            match arg.to_ascii_lowercase().as_str() {
                "-validation" => cli.validation = true,
                "-warp" => cli.warp = true,
                "-console" => cli.console = true,
                "-headless" => cli.headless = true,
                "-sample" => {
                    let name = value(arg)?;
                    cli.sample = SampleKind::from_name(&name)
                        .ok_or_else(|| Error::Usage(format!("unknown sample `{name}`")))?;
                }
                "-shaders" => cli.shaders = Some(PathBuf::from(value(arg)?)),
                "-frames" => cli.frames = number(arg, &value(arg)?)?,
                "-width" => cli.width = number(arg, &value(arg)?)?.max(1),
                "-height" => cli.height = number(arg, &value(arg)?)?.max(1),
                _ => cli.ignored.push(arg.to_owned()),
            }
        }

        Ok(cli)
    }

    pub fn report_ignored(&self) {
        for arg in &self.ignored {
            log::warn!("Ignoring unknown argument `{arg}`");
        }
    }
}

fn number(flag: &str, value: &str) -> Result<u32> {
    value
        .parse()
        .map_err(|_| Error::Usage(format!("`{flag}` expects a number, got `{value}`")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_arguments() {
        let cli = Cli::parse(Vec::<String>::new()).unwrap();

        assert_eq!(Cli::default(), cli);
        assert_eq!((1280, 720), (cli.width, cli.height));
    }

    #[test]
    fn parses_every_flag() {
        let cli = Cli::parse([
            "-validation",
            "-WARP",
            "-console",
            "-headless",
            "-sample",
            "intersection",
            "-shaders",
            "out/shaders",
            "-frames",
            "10",
            "-width",
            "0",
            "-height",
            "480",
        ])
        .unwrap();

        assert!(cli.validation && cli.warp && cli.console && cli.headless);
        assert_eq!(SampleKind::Intersection, cli.sample);
        assert_eq!(Some(PathBuf::from("out/shaders")), cli.shaders);
        assert_eq!(10, cli.frames);
        assert_eq!((1, 480), (cli.width, cli.height));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(Cli::parse(["-sample", "Refraction"]), Err(Error::Usage(_))));
        assert!(matches!(Cli::parse(["-frames", "many"]), Err(Error::Usage(_))));
        assert!(matches!(Cli::parse(["-sample"]), Err(Error::Usage(_))));
    }

    #[test]
    fn unknown_flags_are_ignored() {
        let cli = Cli::parse(["-fullscreen", "-headless", "-vsync"]).unwrap();

        assert!(cli.headless);
        assert_eq!(vec!["-fullscreen", "-vsync"], cli.ignored);
    }
}

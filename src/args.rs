use std::fmt;

/// The default configuration file path, used when no `--config` argument is present.
pub const DEFAULT_CONFIG_PATH: &str = "manifold.yaml";

/// Gets a small string with this program's name and version.
pub fn get_version_string() -> String {
    format!(
        concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"), " ({} {})"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// Gets a string with this program's help documentation.
pub fn get_help_string() -> &'static str {
    concat!(
        "Usage: manifold [options...]\n",
        "Options:\n",
        "  -h, --help             Display this help menu and exit\n",
        "  -V, --version          Display the version number and exit\n",
        "  -c, --config <path>    Specify the configuration file (default: manifold.yaml)\n",
        "  -t, --test             Validate the configuration, print a summary and exit\n",
    )
}

/// The result of parsing the program's arguments.
#[derive(Debug, PartialEq, Eq)]
pub enum ArgumentsRequest {
    /// Print the help menu to stdout and exit.
    Help,

    /// Print this program's version to stdout and exit.
    Version,

    /// Run with the provided arguments.
    Run(StartupArguments),
}

/// Specifies the information on how the program should run.
#[derive(Debug, PartialEq, Eq)]
pub struct StartupArguments {
    /// The path of the YAML configuration file to load.
    pub config_path: String,

    /// Whether to just validate the configuration and exit.
    pub test_config: bool,
}

impl StartupArguments {
    fn new() -> Self {
        Self {
            config_path: String::from(DEFAULT_CONFIG_PATH),
            test_config: false,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ArgumentsError {
    UnknownArgument(String),
    MissingConfigPath(String),
}

impl fmt::Display for ArgumentsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownArgument(arg) => write!(f, "Unknown argument: {arg}"),
            Self::MissingConfigPath(arg) => write!(f, "Expected file path after {arg}"),
        }
    }
}

/// Parses the program's arguments. The first argument is expected to be the program's name and
/// is skipped.
pub fn parse_arguments<T>(mut args: T) -> Result<ArgumentsRequest, ArgumentsError>
where
    T: Iterator<Item = String>,
{
    let mut result = StartupArguments::new();

    // Ignore the first argument, as it's by convention the name of the program
    args.next();

    while let Some(arg) = args.next() {
        if arg.is_empty() {
            continue;
        } else if arg.eq("-h") || arg.eq_ignore_ascii_case("--help") {
            return Ok(ArgumentsRequest::Help);
        } else if arg.eq("-V") || arg.eq_ignore_ascii_case("--version") {
            return Ok(ArgumentsRequest::Version);
        } else if arg.eq("-c") || arg.eq_ignore_ascii_case("--config") {
            match args.next() {
                Some(path) if !path.is_empty() => result.config_path = path,
                _ => return Err(ArgumentsError::MissingConfigPath(arg)),
            }
        } else if arg.eq("-t") || arg.eq_ignore_ascii_case("--test") {
            result.test_config = true;
        } else {
            return Err(ArgumentsError::UnknownArgument(arg));
        }
    }

    Ok(ArgumentsRequest::Run(result))
}

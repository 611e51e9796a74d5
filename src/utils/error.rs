use thiserror::Error;

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("Zip operation failed: {0}")]
    ZipError(#[from] zip::result::ZipError),

    #[error("Package index request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("CSV processing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Missing configuration field: {field}")]
    MissingConfigError { field: String },

    #[error("Invalid value for {field}: '{value}' ({reason})")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Configuration validation failed for {field}: {message}")]
    ConfigValidationError { field: String, message: String },

    #[error("Build input error at {path}: {reason}")]
    BuildInputError { path: String, reason: String },

    #[error("Manifest syntax error on line {line} ('{content}'): {reason}")]
    ManifestSyntaxError {
        line: usize,
        content: String,
        reason: String,
    },

    #[error("Dependency resolution failed for '{package}': {reason}")]
    DependencyResolutionError { package: String, reason: String },

    #[error("Package installer failed: {message}")]
    InstallerError { message: String },

    #[error("Build step '{step}' failed: {source}")]
    StepFailed {
        step: String,
        #[source]
        source: Box<BootstrapError>,
    },

    #[error("Illegal build transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Launch failed: {message}")]
    LaunchError { message: String },

    #[error("Invalid agent input: {message}")]
    AgentInputError { message: String },

    #[error("Data processing error: {message}")]
    ProcessingError { message: String },

    #[error("Workflow error: {message}")]
    WorkflowError { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    BuildInput,
    Dependency,
    Network,
    Launch,
    Application,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl BootstrapError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::MissingConfigError { .. }
            | Self::InvalidConfigValueError { .. }
            | Self::ConfigValidationError { .. } => ErrorCategory::Configuration,
            Self::BuildInputError { .. } | Self::ManifestSyntaxError { .. } => {
                ErrorCategory::BuildInput
            }
            Self::DependencyResolutionError { .. } | Self::InstallerError { .. } => {
                ErrorCategory::Dependency
            }
            Self::HttpError(_) => ErrorCategory::Network,
            Self::LaunchError { .. } => ErrorCategory::Launch,
            Self::AgentInputError { .. }
            | Self::ProcessingError { .. }
            | Self::WorkflowError { .. }
            | Self::CsvError(_) => ErrorCategory::Application,
            Self::StepFailed { source, .. } => source.category(),
            Self::ZipError(_)
            | Self::IoError(_)
            | Self::SerializationError(_)
            | Self::InvalidTransition { .. } => ErrorCategory::System,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::StepFailed { source, .. } => source.severity(),
            Self::HttpError(_) | Self::InstallerError { .. } => ErrorSeverity::Medium,
            Self::IoError(_) | Self::ZipError(_) | Self::InvalidTransition { .. } => {
                ErrorSeverity::Critical
            }
            _ => ErrorSeverity::High,
        }
    }

    /// 給操作者的下一步建議
    pub fn recovery_suggestion(&self) -> String {
        match self.category() {
            ErrorCategory::Configuration => {
                "Check bootstrap.toml and command line overrides".to_string()
            }
            ErrorCategory::BuildInput => {
                "Make sure the source directory and requirements.txt exist and are readable"
                    .to_string()
            }
            ErrorCategory::Dependency => {
                "Check package names and version specifiers in requirements.txt, then re-run the build"
                    .to_string()
            }
            ErrorCategory::Network => {
                "Check network access to the package index and re-run the build".to_string()
            }
            ErrorCategory::Launch => {
                "Inspect the image config and make sure the default command exists in the image"
                    .to_string()
            }
            ErrorCategory::Application => "Check the input data passed to the agent".to_string(),
            ErrorCategory::System => {
                "Check disk space and permissions on the output directory".to_string()
            }
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self {
            Self::StepFailed { step, source } => {
                format!("Build failed during '{}': {}", step, source.user_friendly_message())
            }
            Self::DependencyResolutionError { package, .. } => {
                format!("Could not install dependency '{}'", package)
            }
            Self::ManifestSyntaxError { line, .. } => {
                format!("requirements.txt is invalid at line {}", line)
            }
            other => other.to_string(),
        }
    }

    pub(crate) fn step_failed(step: impl Into<String>, source: BootstrapError) -> Self {
        Self::StepFailed {
            step: step.into(),
            source: Box::new(source),
        }
    }

    pub(crate) fn input(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BuildInputError {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BootstrapError>;

use crate::config::toml_config::{InstallerKind, RecipeConfig};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "app-bootstrap")]
#[command(about = "Build and launch reproducible application images")]
pub struct CliConfig {
    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Emit logs as JSON lines")]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run the build pipeline and publish an image
    Build(BuildArgs),
    /// Print the equivalent Dockerfile for a recipe
    Plan(RecipeArgs),
    /// Show the config of a published image
    Inspect(InspectArgs),
    /// Start the image's default command once
    Launch(LaunchArgs),
}

#[derive(Debug, Clone, Args)]
pub struct RecipeArgs {
    /// Path to the TOML recipe
    #[arg(short, long, default_value = "bootstrap.toml")]
    pub config: PathBuf,
}

#[derive(Debug, Clone, Args)]
pub struct BuildArgs {
    #[command(flatten)]
    pub recipe: RecipeArgs,

    /// Override the host source directory
    #[arg(long)]
    pub source: Option<String>,

    /// Override the output directory
    #[arg(long)]
    pub output: Option<String>,

    /// Override the image tag
    #[arg(long)]
    pub tag: Option<String>,

    /// Override the dependency installer
    #[arg(long, value_enum)]
    pub installer: Option<InstallerArg>,

    /// Also write a zip bundle of the published image
    #[arg(long)]
    pub archive: bool,

    /// Log CPU and memory usage per build step
    #[arg(long)]
    pub monitor: bool,

    /// Validate the recipe and print the plan without building
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum InstallerArg {
    Index,
    Pip,
}

#[derive(Debug, Clone, Args)]
pub struct InspectArgs {
    /// Published image directory
    pub image: PathBuf,
}

#[derive(Debug, Clone, Args)]
pub struct LaunchArgs {
    /// Published image directory
    pub image: PathBuf,

    /// Command to run instead of the image default
    #[arg(last = true)]
    pub command: Vec<String>,
}

impl BuildArgs {
    /// Apply command line overrides on top of the recipe file.
    pub fn apply(&self, config: &mut RecipeConfig) {
        if let Some(source) = &self.source {
            config.source.path = source.clone();
            tracing::info!("🔧 Source overridden to: {}", source);
        }
        if let Some(output) = &self.output {
            config.output.path = output.clone();
            tracing::info!("🔧 Output overridden to: {}", output);
        }
        if let Some(tag) = &self.tag {
            config.image.tag = tag.clone();
        }
        if let Some(installer) = self.installer {
            config.dependencies.installer = match installer {
                InstallerArg::Index => InstallerKind::Index,
                InstallerArg::Pip => InstallerKind::Pip,
            };
        }
        if self.archive {
            config.output.archive = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_build_with_overrides() {
        let cli = CliConfig::try_parse_from([
            "app-bootstrap",
            "build",
            "--config",
            "recipe.toml",
            "--tag",
            "v2",
            "--installer",
            "pip",
            "--archive",
            "-v",
        ])
        .unwrap();

        assert!(cli.verbose);
        let Command::Build(args) = cli.command else {
            panic!("expected build");
        };
        assert_eq!(args.recipe.config, PathBuf::from("recipe.toml"));

        let mut config = RecipeConfig::from_toml_str("[image]\nname = \"agent\"").unwrap();
        args.apply(&mut config);
        assert_eq!(config.image.tag, "v2");
        assert_eq!(config.dependencies.installer, InstallerKind::Pip);
        assert!(config.output.archive);
    }

    #[test]
    fn test_parse_launch_with_override_command() {
        let cli = CliConfig::try_parse_from([
            "app-bootstrap",
            "launch",
            "images/agent-latest",
            "--",
            "python",
            "-c",
            "print(1)",
        ])
        .unwrap();

        let Command::Launch(args) = cli.command else {
            panic!("expected launch");
        };
        assert_eq!(args.image, PathBuf::from("images/agent-latest"));
        assert_eq!(args.command, vec!["python", "-c", "print(1)"]);
    }
}

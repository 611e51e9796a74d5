use app_bootstrap::config::cli::{BuildArgs, Command, InspectArgs, LaunchArgs, RecipeArgs};
use app_bootstrap::core::dockerfile::render_dockerfile;
use app_bootstrap::utils::error::ErrorSeverity;
use app_bootstrap::utils::logger;
use app_bootstrap::{
    BuildEngine, CliConfig, ImagePipeline, Launcher, LoggingObserver, RecipeConfig, Result,
};
use clap::Parser;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let cli = CliConfig::parse();

    // 初始化日誌
    if cli.log_json {
        logger::init_json_logger(cli.verbose);
    } else {
        logger::init_cli_logger(cli.verbose);
    }
    tracing::debug!("CLI config: {:?}", cli);

    let outcome = match cli.command {
        Command::Build(args) => build(args).await,
        Command::Plan(args) => plan(args),
        Command::Inspect(args) => inspect(args),
        Command::Launch(args) => launch(args).await,
    };

    match outcome {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!(
                "❌ {} (Category: {:?}, Severity: {:?})",
                e,
                e.category(),
                e.severity()
            );
            tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());

            eprintln!("❌ {}", e.user_friendly_message());
            eprintln!("💡 建議: {}", e.recovery_suggestion());

            // 根據錯誤嚴重程度決定退出碼
            let exit_code = match e.severity() {
                ErrorSeverity::Low => 0,
                ErrorSeverity::Medium => 2,
                ErrorSeverity::High => 1,
                ErrorSeverity::Critical => 3,
            };
            if exit_code > 0 {
                std::process::exit(exit_code);
            }
        }
    }
}

fn load_recipe(args: &RecipeArgs) -> Result<RecipeConfig> {
    tracing::info!("📋 Loading recipe from {}", args.config.display());
    RecipeConfig::from_file(&args.config)
}

async fn build(args: BuildArgs) -> Result<i32> {
    let mut config = load_recipe(&args.recipe)?;
    args.apply(&mut config);

    if args.dry_run {
        let recipe = config.to_recipe()?;
        println!("{}", render_dockerfile(&recipe));
        println!("✅ Recipe is valid; would publish {}", recipe.image_ref());
        return Ok(0);
    }

    let monitor_enabled = args.monitor || config.monitoring_enabled();
    if monitor_enabled {
        tracing::info!("🔍 System monitoring enabled");
    }

    let pipeline = ImagePipeline::from_config(&config)?.with_observer(Arc::new(LoggingObserver));
    let engine = BuildEngine::new_with_monitoring(pipeline, monitor_enabled);
    let report = engine.run_with_report().await;

    for record in &report.steps {
        tracing::debug!(
            "{} {} ({:.2?})",
            if record.succeeded { "✓" } else { "✗" },
            record.step,
            record.duration
        );
    }

    let report = report.into_result()?;
    if let Some(image) = &report.image {
        println!("✅ Image ready: {}", engine.pipeline().recipe().image_ref());
        println!("📁 Path: {}", image.path.display());
        println!("🔑 Digest: {}", image.digest);
        if let Some(archive) = &image.archive {
            println!("📦 Archive: {}", archive.display());
        }
    }
    Ok(0)
}

fn plan(args: RecipeArgs) -> Result<i32> {
    let recipe = load_recipe(&args)?.to_recipe()?;
    print!("{}", render_dockerfile(&recipe));
    Ok(0)
}

fn inspect(args: InspectArgs) -> Result<i32> {
    let launcher = Launcher::open(&args.image)?;
    println!("{}", serde_json::to_string_pretty(launcher.config())?);
    Ok(0)
}

async fn launch(args: LaunchArgs) -> Result<i32> {
    let launcher = Launcher::open(&args.image)?;
    let code = launcher.launch(&args.command).await?;
    if code != 0 {
        tracing::warn!("⚠️ Process exited with code {}", code);
    }
    Ok(code)
}

//! Build automation for opsctl
//!
//! Usage: cargo xtask <command>
//!
//! Available commands:
//! - build: Build the project
//! - test: Run unit tests and integration suites
//! - dist: Create a distribution tarball with binary, sample config and hooks dir
//! - install: Install binary, config and agent directories
//! - ci: Run CI checks

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use xshell::{cmd, Shell};

const BINARY: &str = "opsctl";
const SAMPLE_CONFIG: &str = "opsctl.toml.example";

/// Integration suites under tests/.
const SUITES: [&str; 5] = ["fsm_test", "store_test", "package_update_test", "agent_test", "plan_document_test"];

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build automation for opsctl")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the project
    Build {
        /// Build in release mode
        #[arg(long)]
        release: bool,
    },
    /// Run tests
    Test {
        /// Run only integration suites
        #[arg(long)]
        integration: bool,
        /// Run a single integration suite, e.g. fsm_test
        #[arg(long)]
        suite: Option<String>,
    },
    /// Create distribution packages
    Dist {
        /// Target triple (e.g., x86_64-unknown-linux-gnu)
        #[arg(long)]
        target: Option<String>,
    },
    /// Install to system
    Install {
        /// Installation prefix (default: /usr/local)
        #[arg(long, default_value = "/usr/local")]
        prefix: String,
        /// Directory the sample config is copied to
        #[arg(long, default_value = "/etc/opsctl")]
        config_dir: String,
    },
    /// Run CI checks (format, clippy, test)
    Ci,
    /// Format code
    Format {
        /// Check formatting without modifying files
        #[arg(long)]
        check: bool,
    },
    /// Run clippy
    Clippy,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let sh = Shell::new()?;

    sh.change_dir(project_root());

    match cli.command {
        Commands::Build { release } => build(&sh, release),
        Commands::Test { integration, suite } => test(&sh, integration, suite),
        Commands::Dist { target } => dist(&sh, target),
        Commands::Install { prefix, config_dir } => install(&sh, &prefix, &config_dir),
        Commands::Ci => ci(&sh),
        Commands::Format { check } => format(&sh, check),
        Commands::Clippy => clippy(&sh),
    }
}

fn build(sh: &Shell, release: bool) -> Result<()> {
    println!("🔨 Building {}...", BINARY);

    if release {
        cmd!(sh, "cargo build --release --bin {BINARY}").run()?;
        println!("✅ Release build completed: target/release/{}", BINARY);
    } else {
        cmd!(sh, "cargo build --bin {BINARY}").run()?;
        println!("✅ Debug build completed: target/debug/{}", BINARY);
    }

    Ok(())
}

fn test(sh: &Shell, integration: bool, suite: Option<String>) -> Result<()> {
    if let Some(suite) = suite {
        if !SUITES.contains(&suite.as_str()) {
            bail!("unknown suite {}, expected one of {}", suite, SUITES.join(", "));
        }
        println!("🧪 Running {}...", suite);
        cmd!(sh, "cargo test -p {BINARY} --test {suite}").run()?;
        println!("✅ {} passed", suite);
        return Ok(());
    }

    println!("🧪 Running tests...");
    if integration {
        for suite in SUITES {
            cmd!(sh, "cargo test -p {BINARY} --test {suite}").run()?;
        }
    } else {
        cmd!(sh, "cargo test --all").run()?;
    }

    println!("✅ All tests passed");
    Ok(())
}

fn dist(sh: &Shell, target: Option<String>) -> Result<()> {
    println!("📦 Creating distribution package...");

    if let Some(ref target_triple) = target {
        cmd!(sh, "cargo build --release --bin {BINARY} --target {target_triple}").run()?;
    } else {
        cmd!(sh, "cargo build --release --bin {BINARY}").run()?;
    }

    let version = env!("CARGO_PKG_VERSION");
    let stage = format!("{}-{}", BINARY, version);
    let dist_dir = project_root().join("dist").join(&stage);
    sh.remove_path(&dist_dir)?;
    sh.create_dir(dist_dir.join("hooks"))?;

    let binary_src = match target {
        Some(ref target_triple) => project_root().join(format!("target/{}/release/{}", target_triple, BINARY)),
        None => project_root().join(format!("target/release/{}", BINARY)),
    };
    sh.copy_file(&binary_src, dist_dir.join(BINARY))?;
    sh.copy_file(project_root().join(SAMPLE_CONFIG), &dist_dir)?;
    sh.copy_file(project_root().join("README.md"), &dist_dir)?;

    let archive_name = format!("{}.tar.gz", stage);
    cmd!(sh, "tar -czf {archive_name} -C dist {stage}")
        .run()
        .context("Failed to create tarball")?;

    println!("✅ Distribution package created: {}", archive_name);
    Ok(())
}

fn install(sh: &Shell, prefix: &str, config_dir: &str) -> Result<()> {
    println!("📥 Installing {} to {}...", BINARY, prefix);

    let binary = project_root().join(format!("target/release/{}", BINARY));
    if !binary.exists() {
        println!("Building release binary first...");
        cmd!(sh, "cargo build --release --bin {BINARY}").run()?;
    }

    let bin_dir = Path::new(prefix).join("bin");
    sh.create_dir(&bin_dir)?;
    let install_path = bin_dir.join(BINARY);
    sh.copy_file(&binary, &install_path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&install_path, std::fs::Permissions::from_mode(0o755))?;
    }

    // Never overwrite a config an operator already edited.
    let config_dir = Path::new(config_dir);
    let config = config_dir.join("opsctl.toml");
    sh.create_dir(config_dir.join("hooks"))?;
    if config.exists() {
        println!("ℹ️  Keeping existing {}", config.display());
    } else {
        sh.copy_file(project_root().join(SAMPLE_CONFIG), &config)?;
        println!("📝 Sample config written to {}", config.display());
    }

    println!("✅ Installed to: {}", install_path.display());
    println!("   Run `{} agent bootstrap` once per cluster to create the agent token", BINARY);
    Ok(())
}

fn ci(sh: &Shell) -> Result<()> {
    println!("🔍 Running CI checks...");

    println!("\n📝 Checking formatting...");
    format(sh, true)?;

    println!("\n🔧 Running clippy...");
    clippy(sh)?;

    println!("\n🧪 Running tests...");
    test(sh, false, None)?;

    println!("\n✅ All CI checks passed!");
    Ok(())
}

fn format(sh: &Shell, check: bool) -> Result<()> {
    if check {
        cmd!(sh, "cargo fmt --all -- --check").run()?;
        println!("✅ Code formatting is correct");
    } else {
        cmd!(sh, "cargo fmt --all").run()?;
        println!("✅ Code formatted");
    }
    Ok(())
}

fn clippy(sh: &Shell) -> Result<()> {
    cmd!(sh, "cargo clippy --all-targets --all-features -- -D warnings").run()?;
    println!("✅ Clippy checks passed");
    Ok(())
}

fn project_root() -> PathBuf {
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    manifest_dir
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| manifest_dir.to_path_buf())
}

//! Standalone binary to validate governance policy files.
//! Used by CI to ensure policy files load and pass validation.
//!
//! Usage: `validate-policy <file>...`; with no arguments the directory in
//! `GOVERNANCE_POLICY_DIR` (default `policies`) is scanned for
//! `.yaml`, `.yml` and `.json` files.

use anyhow::Context;
use outbound_governance::policy::PolicyLoader;
use std::path::PathBuf;

fn policy_files() -> anyhow::Result<Vec<PathBuf>> {
    let args: Vec<PathBuf> = std::env::args().skip(1).map(PathBuf::from).collect();
    if !args.is_empty() {
        return Ok(args);
    }
    let dir = std::env::var("GOVERNANCE_POLICY_DIR").unwrap_or_else(|_| "policies".to_string());
    println!("Using policy directory: {}", dir);
    let mut files = std::fs::read_dir(&dir)
        .with_context(|| format!("cannot read policy directory {}", dir))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| matches!(ext, "yaml" | "yml" | "json"))
                .unwrap_or(false)
        })
        .collect::<Vec<_>>();
    files.sort();
    Ok(files)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let files = policy_files()?;
    if files.is_empty() {
        anyhow::bail!("no policy files found");
    }

    let mut errors = Vec::new();

    println!("\n=== Validating Policy Files ===");
    for file in &files {
        print!("Validating {}... ", file.display());
        match PolicyLoader::from_path(file) {
            Ok(config) => {
                let paths: usize = config.services.values().map(|s| s.paths.len()).sum();
                println!(
                    "✅ ({} service(s), {} path policy(ies))",
                    config.services.len(),
                    paths
                );
            }
            Err(e) => {
                println!("❌");
                errors.push(format!("  {}: {}", file.display(), e));
            }
        }
    }

    println!("\n=== Summary ===");
    if errors.is_empty() {
        println!("✅ All policy files are valid!");
        Ok(())
    } else {
        println!("❌ Found {} validation error(s):\n", errors.len());
        for err in &errors {
            println!("{}", err);
        }
        std::process::exit(1);
    }
}

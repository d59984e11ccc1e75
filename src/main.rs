use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use console::Term;

use page_mirror::cli::MirrorCommand;
use page_mirror::logging;
use page_mirror::mirror::{Mirror, MirrorSummary};

#[tokio::main]
async fn main() -> ExitCode {
    let args = MirrorCommand::parse();
    logging::init(args.verbose, args.quiet);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {:#}", "❌ Mirroring failed:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: MirrorCommand) -> Result<()> {
    let json = args.json;
    let quiet = args.quiet;
    let request = args.into_request(&Term::stderr())?;

    let mirror = Mirror::new(request.options);
    let cancel = mirror.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    if !json && !quiet {
        println!("🌐 Mirroring {}", request.target.root_url.as_str().cyan());
    }
    let summary = mirror
        .run(&request.target, request.credentials.as_ref())
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else if !quiet {
        print_summary(&summary);
    }
    Ok(())
}

fn print_summary(summary: &MirrorSummary) {
    println!(
        "✅ Page saved to {}",
        summary.output_root.join("index.html").display().to_string().green()
    );
    println!(
        "📦 Assets: {} total, {} saved, {} failed ({:.1}s)",
        summary.total_assets,
        summary.succeeded.to_string().green(),
        if summary.failed > 0 {
            summary.failed.to_string().red()
        } else {
            summary.failed.to_string().normal()
        },
        summary.elapsed.as_secs_f64()
    );
    for (category, count) in &summary.by_category {
        println!("   {:?}: {}", category, count);
    }
    for failure in &summary.failures {
        println!("   {} {} ({})", "✗".red(), failure.url, failure.reason.dimmed());
    }
    if summary.parse_warnings > 0 {
        println!(
            "{}",
            format!("⚠️  {} markup issues were tolerated", summary.parse_warnings).yellow()
        );
    }
    if let Some(archive) = &summary.archive {
        println!("🗜️  Archive: {}", archive.display().to_string().green());
    }
}

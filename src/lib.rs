use std::fs;
use std::path::PathBuf;

use clap::Parser;

pub mod facts;
pub mod fetch;
pub mod oval;
pub mod reboot;
pub mod scan;
pub mod tweaks;

use facts::Facts;
use tweaks::Tweaks;

pub const DEFINITIONS_FILE: &str = "oval-definitions.xml";
pub const RESULTS_FILE: &str = "oval-results.xml";
pub const REPORT_FILE: &str = "oval-report.html";

#[derive(Parser, Debug)]
#[command(about = "Convert oval results into puppet facts")]
pub struct Opts {
    /// Where to keep intermediate files
    #[arg(long, default_value = "/var/lib/openscap")]
    pub vardir: PathBuf,
    /// Where to write the resulting yaml
    #[arg(long, default_value = "/etc/puppetlabs/facter/facts.d/openscap.yaml")]
    pub factfile: PathBuf,
    /// Url with oval definitions
    #[arg(long)]
    pub defurl: String,
    /// Log things into this logfile
    #[arg(long, default_value = "/var/log/openscap-oval-facter.log")]
    pub logfile: PathBuf,
    /// Randomly sleep up to this many seconds
    #[arg(long)]
    pub sleep: Option<u64>,
    /// Only output critical errors
    #[arg(long)]
    pub quiet: bool,
    /// Yaml file with definition tweaks and overrides
    #[arg(long)]
    pub tweaks: Option<PathBuf>,
    /// Hint if a system needs a reboot
    #[arg(long)]
    pub needsreboot: bool,
}

/// How a run ended. A missing fact file is the expected failure signal for
/// this tool: external file-age monitoring alerts when a report goes stale,
/// so almost every internal failure abandons the run with exit code 0
/// instead of looking like a crash to the supervisor.
#[derive(Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// Fact file written.
    Published,
    /// Gave up without output; already logged.
    Abandoned,
}

/// Runs the whole pipeline. The only error that escapes is a fact-file write
/// failure; every other failure is logged and mapped to `Abandoned`.
pub async fn run(opts: &Opts) -> anyhow::Result<RunOutcome> {
    let tweaks = match &opts.tweaks {
        Some(path) => match Tweaks::load(path) {
            Ok(tweaks) => tweaks,
            Err(e) => {
                log::info!("could not load tweaks from {}: {e:#}", path.display());
                return Ok(RunOutcome::Abandoned);
            }
        },
        None => Tweaks::default(),
    };

    let local_defs = opts.vardir.join(DEFINITIONS_FILE);
    if let Err(e) = fetch::download_definitions(&opts.defurl, &local_defs).await {
        log::info!("was not able to download {}, giving up: {e:#}", opts.defurl);
        return Ok(RunOutcome::Abandoned);
    }

    if !tweaks.definition_fixes.is_empty() {
        if let Err(e) = oval::patch_definitions_file(&local_defs, &tweaks.definition_fixes) {
            log::info!("error mangling {}: {e:#}", local_defs.display());
            return Ok(RunOutcome::Abandoned);
        }
    }

    let results_path = opts.vardir.join(RESULTS_FILE);
    let report_path = opts.vardir.join(REPORT_FILE);
    if let Err(e) = scan::run_evaluator(&local_defs, &results_path, &report_path).await {
        log::info!("error running oscap eval: {e:#}");
        return Ok(RunOutcome::Abandoned);
    }

    log::info!("parsing {}", results_path.display());
    let results_xml = match fs::read_to_string(&results_path) {
        Ok(xml) => xml,
        Err(e) => {
            log::info!("was not able to read {}: {e:#}", results_path.display());
            return Ok(RunOutcome::Abandoned);
        }
    };
    let mut summary = match oval::parse_results(&results_xml)
        .and_then(|results| oval::summarize(&results, &tweaks.severity_changes))
    {
        Ok(summary) => summary,
        Err(e) => {
            log::info!("was not able to parse {}: {e:#}", results_path.display());
            return Ok(RunOutcome::Abandoned);
        }
    };

    if opts.needsreboot {
        match reboot::stale_reboot_packages(&tweaks.reboot_packages()).await {
            Ok(stale) if !stale.is_empty() => {
                summary.needs_reboot = Some(true);
                summary.reboot_pkgs = Some(stale);
            }
            Ok(_) => {}
            Err(e) => {
                log::info!("could not check reboot packages: {e:#}");
                return Ok(RunOutcome::Abandoned);
            }
        }
    }

    log::info!("writing {}", opts.factfile.display());
    facts::write_fact_file(&opts.factfile, &Facts::new(summary))?;
    Ok(RunOutcome::Published)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::Path;

    fn test_opts(dir: &Path) -> Opts {
        Opts {
            vardir: dir.to_path_buf(),
            factfile: dir.join("openscap.yaml"),
            defurl: "http://127.0.0.1:9/definitions.xml".to_string(),
            logfile: dir.join("openscap.log"),
            sleep: None,
            quiet: true,
            tweaks: None,
            needsreboot: false,
        }
    }

    #[tokio::test]
    async fn test_bad_tweaks_abandons_without_facts() {
        let dir = tempfile::tempdir().unwrap();
        let mut tweaks = tempfile::NamedTempFile::new().unwrap();
        tweaks
            .write_all(b"definition_fixes: [not, a, mapping]\n")
            .unwrap();

        let mut opts = test_opts(dir.path());
        opts.tweaks = Some(tweaks.path().to_path_buf());

        let outcome = run(&opts).await.unwrap();
        assert_eq!(outcome, RunOutcome::Abandoned);
        assert!(!opts.factfile.exists());
    }
}

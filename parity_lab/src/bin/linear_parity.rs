use std::{env, path::PathBuf};

use anyhow::{bail, Context, Result};
use linear_core::{
    config::{Epilogue, ParityConfig},
    Precision,
};
use parity_lab::{
    checker::{check_equivalence, Outcome},
    report::{export_report_json, ParityReport},
    GradientKind, OperatorKind,
};

struct CliOptions {
    config: ParityConfig,
    kind: OperatorKind,
    export_json: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracer::init_tracing();
    let options = parse_options()?;
    let config = &options.config;
    config.validate()?;

    println!(
        "Checking {} against reference (in={}, out={}, batch={}, bias={}, epilogue={:?}, iterations={})",
        options.kind,
        config.input_features,
        config.output_features,
        config.batch_size,
        config.bias,
        config.epilogue,
        config.iterations
    );

    let runs = check_equivalence(config, options.kind)
        .with_context(|| format!("failed to run the {} operator", options.kind))?;
    let report = ParityReport::new(
        format!("{}_vs_reference", options.kind),
        options.kind,
        runs,
    );

    for run in &report.runs {
        println!(
            "Iteration {} [{}] seed=0x{:X} batch_seed=0x{:X} tolerance={:.1e}",
            run.iteration, run.report.precision, run.seed, run.batch_seed, run.report.tolerance
        );
        for kind in GradientKind::ALL {
            if let Some(outcome) = run.report.outcome(kind) {
                println!("  {:<6} {}", kind.label(), describe(outcome));
            }
        }
    }

    if let Some(ref path) = options.export_json {
        export_report_json(std::slice::from_ref(&report), path)?;
        println!("Exported report '{}' to {}", report.label, path.display());
    }

    if let Some(run) = report.failures().next() {
        run.report
            .ensure_passed()
            .with_context(|| format!("iteration {} seed=0x{:X}", run.iteration, run.seed))?;
        bail!("gradients diverged beyond tolerance");
    }
    println!("All gradients within tolerance.");
    Ok(())
}

fn describe(outcome: &Outcome) -> String {
    match outcome {
        Outcome::BothAbsent => "absent on both sides".to_string(),
        Outcome::Matched { max_abs_diff } => format!("ok   max |diff| {max_abs_diff:.3e}"),
        Outcome::Diverged {
            max_abs_diff,
            index,
            lhs,
            rhs,
        } => format!("FAIL max |diff| {max_abs_diff:.3e} at #{index}: candidate={lhs} reference={rhs}"),
        Outcome::PresenceMismatch {
            lhs_present,
            rhs_present,
        } => format!("FAIL present: candidate={lhs_present} reference={rhs_present}"),
        Outcome::ShapeMismatch { lhs, rhs } => {
            format!("FAIL shape: candidate={lhs:?} reference={rhs:?}")
        }
    }
}

fn parse_options() -> Result<CliOptions> {
    let args: Vec<String> = env::args().skip(1).collect();

    let mut config = ParityConfig::default();
    for arg in &args {
        if let Some(value) = arg.strip_prefix("--config=") {
            config = ParityConfig::load(value)?;
        }
    }

    let mut opts = CliOptions {
        config,
        kind: OperatorKind::Packed,
        export_json: None,
    };

    for arg in &args {
        if arg.starts_with("--config=") {
            continue;
        } else if let Some(value) = arg.strip_prefix("--kind=") {
            opts.kind = value.parse().context("invalid --kind value")?;
        } else if let Some(value) = arg.strip_prefix("--seed=") {
            opts.config.seed = Some(parse_seed(value).context("invalid --seed value")?);
        } else if let Some(value) = arg.strip_prefix("--batch-seed=") {
            opts.config.batch_seed = Some(parse_seed(value).context("invalid --batch-seed value")?);
        } else if let Some(value) = arg.strip_prefix("--batch=") {
            opts.config.batch_size = value.parse().context("invalid --batch value")?;
        } else if let Some(value) = arg.strip_prefix("--in=") {
            opts.config.input_features = value.parse().context("invalid --in value")?;
        } else if let Some(value) = arg.strip_prefix("--out=") {
            opts.config.output_features = value.parse().context("invalid --out value")?;
        } else if let Some(value) = arg.strip_prefix("--iterations=") {
            opts.config.iterations = value.parse().context("invalid --iterations value")?;
        } else if let Some(value) = arg.strip_prefix("--precisions=") {
            opts.config.precisions = value
                .split(',')
                .map(str::parse::<Precision>)
                .collect::<Result<_>>()
                .context("invalid --precisions value")?;
        } else if let Some(value) = arg.strip_prefix("--export-json=") {
            opts.export_json = Some(PathBuf::from(value));
        } else if arg == "--no-bias" {
            opts.config.bias = false;
        } else if arg == "--relu" {
            opts.config.epilogue = Epilogue::Relu;
        } else {
            bail!("unrecognized argument: {arg}");
        }
    }

    Ok(opts)
}

fn parse_seed(value: &str) -> Result<u64> {
    if let Some(hex) = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16).context("expected hex literal")
    } else {
        value.parse().context("expected integer seed")
    }
}

mod tracer {
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt().try_init();
    }
}

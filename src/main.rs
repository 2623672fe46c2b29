// # grove
//
// Main entry point for the categorized extended isolation forest tool.
// Builds the settings from defaults, rc file and options, then runs the
// requested training, analysis, categorization, reporting and persistence
// steps in a fixed order.

use grove::analyze::{self, ReportFormats};
use grove::cli::{self, Op};
use grove::config::{Settings, DEFAULT_RC_FILE};
use grove::engine::Engine;
use grove::error::{GroveError, Result};
use grove::{persist, report, VERSION};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use tracing::Level;

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Err(e) = run(&args) {
        eprintln!("grove: {}", e);
        std::process::exit(1);
    }
}

/// Per-run driver state collected from the option list.
#[derive(Default)]
struct Run {
    learn_file: Option<String>,
    analyze_file: Option<String>,
    categorize_file: Option<String>,
    save_file: Option<String>,
    output_file: Option<String>,
    run_test: bool,
    test_extension_factor: f64,
    test_interval: usize,
    make_query: bool,
    print_density: bool,
    common_scale: bool,
    print_sample_scores: bool,
    print_correlation: bool,
    kill_outlier: usize,
    missing_format: Option<String>,
    average_format: Option<String>,
    not_found_format: Option<String>,
    delete_interval: Option<i64>,
    score_option_given: bool,
    preloaded: bool,
}

fn open_input(path: &str) -> Result<BufReader<File>> {
    let file = File::open(path).map_err(|e| GroveError::File {
        path: path.to_string(),
        source: e,
    })?;
    Ok(BufReader::new(file))
}

fn run(args: &[String]) -> Result<()> {
    let ops = cli::parse_args(args)?;

    if ops.iter().any(|op| matches!(op, Op::Help)) {
        print!("{}", cli::USAGE);
        return Ok(());
    }
    if ops.iter().any(|op| matches!(op, Op::Version)) {
        println!("grove version {}", VERSION);
        return Ok(());
    }

    let mut settings = Settings::default();
    settings.load_rc_file(DEFAULT_RC_FILE, false)?;

    // the seed must be in place before any forest data is replayed
    for op in &ops {
        if let Op::Seed(seed) = op {
            settings.seed = Some(*seed);
        }
    }

    let mut engine = Engine::new(settings)?;
    let mut run = Run {
        test_interval: 256,
        ..Run::default()
    };

    apply_ops(&mut engine, &mut run, ops)?;

    let level = if engine.settings.debug > 0 {
        Level::DEBUG
    } else {
        Level::WARN
    };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    // trees are only needed when something will score records
    let make_tree = run.analyze_file.is_some()
        || run.categorize_file.is_some()
        || run.run_test
        || run.make_query
        || run.print_sample_scores
        || run.kill_outlier > 0
        || run.print_correlation
        || run.average_format.is_some();

    let mut out: Box<dyn Write> = match &run.output_file {
        Some(path) => {
            let file = File::create(path).map_err(|e| GroveError::File {
                path: path.to_string(),
                source: e,
            })?;
            Box::new(BufWriter::new(file))
        }
        None => Box::new(std::io::stdout()),
    };

    // train from loaded state, or from the training file when nothing was
    // loaded; the training file is consumed here in that case
    if engine.has_forests() {
        engine.train(None::<BufReader<File>>, true, make_tree)?;
    } else if let Some(path) = run.learn_file.take() {
        engine.train(Some(open_input(&path)?), true, make_tree)?;
    }

    for _ in 0..run.kill_outlier {
        engine.remove_outlier();
    }

    if run.print_density {
        report::print_sample_density(&engine, &mut out, run.common_scale)?;
        return Ok(());
    }

    if let Some(path) = &run.analyze_file {
        let formats = ReportFormats {
            not_found: run.not_found_format.as_deref(),
            average: run.average_format.as_deref(),
        };
        analyze::analyze(&mut engine, open_input(path)?, &mut out, &formats)?;
        if let Some(fmt) = &run.missing_format {
            analyze::print_missing_categories(&engine, &mut out, fmt)?;
        }
    }

    if let Some(path) = &run.categorize_file {
        analyze::categorize(
            &mut engine,
            open_input(path)?,
            run.score_option_given,
            &mut out,
        )?;
    }

    // with a preloaded state, training data only adds samples; a rebuild
    // happens on the next run
    if let Some(path) = &run.learn_file {
        engine.train(Some(open_input(path)?), !run.preloaded, false)?;
    }

    if run.make_query {
        report::print_forest_info(&mut engine, &mut out)?;
        return Ok(());
    }
    if run.print_sample_scores {
        report::print_sample_scores(&mut engine, &mut out)?;
        return Ok(());
    }
    if run.print_correlation {
        report::print_correlation(&engine, &mut out)?;
        return Ok(());
    }

    if let Some(path) = &run.save_file {
        persist::save(&engine, path, run.delete_interval)?;
    }

    if run.run_test {
        analyze::test_grid(
            &mut engine,
            &mut out,
            run.test_extension_factor,
            run.test_interval,
        )?;
    }

    Ok(())
}

/// Apply the ordered option list to the engine and the run plan.
fn apply_ops(engine: &mut Engine, run: &mut Run, ops: Vec<Op>) -> Result<()> {
    for op in ops {
        match op {
            Op::Decimals(n) => engine.settings.decimals = n,
            Op::IgnoreDims(list) => {
                engine.settings.ignore_dims = list;
                engine.rebuild_dims()?;
            }
            Op::IncludeDims(list) => {
                engine.settings.include_dims = list;
                engine.rebuild_dims()?;
            }
            Op::Trees(n) => engine.settings.trees = n,
            Op::Samples(n) => engine.settings.samples_per_tree = n,
            Op::InputSeparator(sep) => engine.settings.input_separator = sep,
            Op::Learn(path) => run.learn_file = Some(path),
            Op::Analyze(path) => run.analyze_file = Some(path),
            Op::Categorize(path) => run.categorize_file = Some(path),
            Op::Template(t) => engine.settings.template = t,
            Op::DimensionTemplate(t) => engine.settings.dimension_template = Some(t),
            Op::Score(spec) => {
                engine.settings.set_score(&spec)?;
                run.score_option_given = true;
            }
            Op::SaveForest(path) => run.save_file = Some(path),
            Op::LoadForest(path) => {
                if !engine.has_forests() {
                    persist::load(engine, &path, false)?;
                    run.preloaded = true;
                }
            }
            Op::InplaceForest(path) => {
                if run.save_file.is_none() {
                    run.save_file = Some(path.clone());
                }
                if !engine.has_forests() && persist::load(engine, &path, true)? {
                    run.preloaded = true;
                }
            }
            Op::CategoryDims(list) => {
                engine.settings.category_dims = list;
                engine.rebuild_dims()?;
            }
            Op::LabelDims(list) => {
                engine.settings.label_dims = list;
                engine.rebuild_dims()?;
            }
            Op::Header => engine.settings.header = true,
            // numeric output stays in the C locale; timestamps already
            // render in the local timezone
            Op::SetLocale => {}
            Op::Output(path) => run.output_file = Some(path),
            Op::Filter(re) => engine.settings.filters.push(re),
            Op::Test(factor) => {
                run.run_test = true;
                if let Some(f) = factor {
                    run.test_extension_factor = f;
                }
            }
            Op::TestInterval(n) => run.test_interval = n,
            Op::UniqueSamples(percent) => {
                engine.settings.unique_samples = percent.unwrap_or(10);
            }
            Op::PrintfFormat(fmt) => engine.settings.printf_format = fmt,
            Op::ListSeparator(sep) => engine.settings.list_separator = sep,
            Op::Missing(fmt) => {
                run.missing_format = Some(fmt.unwrap_or_else(|| "%C".to_string()));
            }
            Op::DeleteInterval(secs) => run.delete_interval = Some(secs),
            Op::NewFormat(fmt) => {
                run.not_found_format = Some(fmt.unwrap_or_else(|| "%v".to_string()));
            }
            Op::Aggregate => engine.settings.aggregate = true,
            Op::TextDims(list) => {
                engine.settings.text_dims = list;
                engine.rebuild_dims()?;
            }
            Op::ScoreDims(list) => {
                engine.settings.score_dims = list;
                engine.rebuild_dims()?;
            }
            Op::Query => run.make_query = true,
            Op::Density { common_scale } => {
                run.print_density = true;
                run.common_scale = common_scale;
            }
            Op::SampleScores => run.print_sample_scores = true,
            Op::RemoveOutlier => run.kill_outlier += 1,
            Op::RcFile(path) => {
                let seed_before = engine.settings.seed;
                engine.settings.load_rc_file(&path, true)?;
                engine.rebuild_dims()?;
                if engine.settings.seed != seed_before {
                    if let Some(seed) = engine.settings.seed {
                        engine.reseed(seed);
                    }
                }
            }
            Op::Correlation => run.print_correlation = true,
            Op::Average(fmt) => {
                run.average_format = Some(fmt.unwrap_or_else(|| "%C %r %h".to_string()));
            }
            Op::ResetForest(key) => {
                // an unknown forest is reported but not fatal
                if let Err(e) = engine.remove_samples(&key) {
                    eprintln!("grove: {}", e);
                }
            }
            Op::Expression(spec) => engine.formulas.add(&spec)?,
            Op::Seed(seed) => engine.reseed(seed),
            Op::Help | Op::Version => {}
        }
    }
    Ok(())
}

//! Misalign Probe CLI
//!
//! Generate datasets, run a local model over them, score and chart the results.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use misalign_probe::config::{BackendKind, ConfigOverrides, ExperimentConfig, PromptVariant};
use misalign_probe::dataset::{self, DatasetSpec, Op};
use misalign_probe::records::{self, SummaryRecord};
use misalign_probe::report::ReportFormat;
use misalign_probe::runner::{
    ArithmeticRunner, CategoryTally, FirstLetterRunner, FIRST_LETTER_MAX_TOKENS,
    FIRST_LETTER_TEMPERATURE,
};
use misalign_probe::scoring::{score_arithmetic, score_first_letter};
use misalign_probe::{aggregate, plot, words, ModelCaller, ReportBuilder};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "configs/config.yaml";

#[derive(Parser)]
#[command(name = "misalign-probe")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Model selection shared by the run commands
#[derive(Args)]
struct ModelArgs {
    /// Experiment configuration (YAML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Model name (overrides config)
    #[arg(long)]
    model: Option<String>,

    /// Sampling temperature (overrides config)
    #[arg(long)]
    temperature: Option<f64>,

    /// Nucleus sampling threshold (overrides config)
    #[arg(long)]
    top_p: Option<f64>,

    /// Token budget per response (overrides config)
    #[arg(long)]
    max_tokens: Option<u32>,

    /// Transport: http or cli (overrides config)
    #[arg(long)]
    backend: Option<BackendKind>,
}

impl ModelArgs {
    fn load_config(&self, defaults: ConfigOverrides) -> Result<ExperimentConfig> {
        let mut config = match &self.config {
            Some(path) => ExperimentConfig::load(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => ExperimentConfig::load_or_default(DEFAULT_CONFIG)
                .with_context(|| format!("loading config {DEFAULT_CONFIG}"))?,
        };
        config.apply_overrides(defaults);
        config.apply_overrides(ConfigOverrides {
            model: self.model.clone(),
            temperature: self.temperature,
            top_p: self.top_p,
            max_tokens: self.max_tokens,
            backend: self.backend,
        });
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a seeded arithmetic dataset
    GenerateDataset {
        /// Output CSV
        #[arg(long, default_value = "data/arith_dataset.csv")]
        out: PathBuf,

        /// Number of questions
        #[arg(long, default_value_t = 100)]
        n: usize,

        /// Smallest operand (inclusive)
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        min: i64,

        /// Largest operand (inclusive)
        #[arg(long, default_value_t = 99, allow_hyphen_values = true)]
        max: i64,

        /// Operators to draw from
        #[arg(long, num_args = 1.., default_values = ["+", "-"], allow_hyphen_values = true)]
        ops: Vec<Op>,

        /// RNG seed
        #[arg(long, default_value_t = 1234)]
        seed: u64,
    },

    /// Build a word list from a frequency corpus
    GenerateWords {
        /// Corpus file, one word per line in frequency order
        #[arg(long)]
        corpus: PathBuf,

        /// Output word list
        #[arg(long)]
        out: PathBuf,

        /// Number of words to keep
        #[arg(long, default_value_t = words::DEFAULT_COUNT)]
        count: usize,

        /// Corpus entries to consider
        #[arg(long, default_value_t = words::DEFAULT_TOP_N)]
        top: usize,
    },

    /// Run the arithmetic experiment for one prompt variant
    Run {
        /// Dataset CSV
        #[arg(long, default_value = "data/arith_dataset.csv")]
        dataset: PathBuf,

        /// Prompt variant: normal, proxy or shifted
        #[arg(long)]
        variant: PromptVariant,

        /// Output CSV (default: runs/<run_id>_<variant>.csv)
        #[arg(long)]
        out: Option<PathBuf>,

        #[command(flatten)]
        model: ModelArgs,
    },

    /// Run the first-letter experiment over a word list
    RunFirstLetter {
        /// Word list, one word per line
        #[arg(long)]
        words: PathBuf,

        /// Output CSV
        #[arg(long, default_value = "results_firstletter.csv")]
        out: PathBuf,

        #[command(flatten)]
        model: ModelArgs,
    },

    /// Score one response without calling a model
    Score {
        /// Model response text
        #[arg(long)]
        response: String,

        /// Word for the first-letter task
        #[arg(long, conflicts_with = "answer", required_unless_present = "answer")]
        word: Option<String>,

        /// Correct answer for the arithmetic task
        #[arg(long, allow_hyphen_values = true)]
        answer: Option<i64>,
    },

    /// Aggregate arithmetic runs into a summary table
    Aggregate {
        /// Glob matching run CSVs
        #[arg(long, default_value = "runs/*.csv")]
        runs: String,

        /// Summary CSV
        #[arg(long, default_value = "summary/summary.csv")]
        out_table: PathBuf,

        /// Optional stacked-bar chart (SVG)
        #[arg(long)]
        out_figure: Option<PathBuf>,

        /// Optional report (.md or .json)
        #[arg(long)]
        out_report: Option<PathBuf>,
    },

    /// Chart a summary table
    Plot {
        /// Summary CSV
        #[arg(long, default_value = "summary/summary.csv")]
        summary: PathBuf,

        /// Output chart (SVG)
        #[arg(long, default_value = "figures/summary.svg")]
        out: PathBuf,
    },

    /// Chart a first-letter results table
    PlotFirstLetter {
        /// First-letter results CSV
        #[arg(long, default_value = "results_firstletter.csv")]
        results: PathBuf,

        /// Output chart (SVG)
        #[arg(long, default_value = "figures/first_letter.svg")]
        out: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli.command) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::GenerateDataset {
            out,
            n,
            min,
            max,
            ops,
            seed,
        } => {
            let spec = DatasetSpec {
                n,
                min,
                max,
                ops,
                seed,
            };
            generate_dataset(&out, spec)
        }
        Commands::GenerateWords {
            corpus,
            out,
            count,
            top,
        } => generate_words(&corpus, &out, count, top),
        Commands::Run {
            dataset,
            variant,
            out,
            model,
        } => run_arithmetic(&dataset, variant, out, &model),
        Commands::RunFirstLetter { words, out, model } => run_first_letter(&words, &out, &model),
        Commands::Score {
            response,
            word,
            answer,
        } => {
            score(&response, word.as_deref(), answer);
            Ok(())
        }
        Commands::Aggregate {
            runs,
            out_table,
            out_figure,
            out_report,
        } => aggregate_runs(&runs, &out_table, out_figure.as_deref(), out_report.as_deref()),
        Commands::Plot { summary, out } => {
            let bars = plot::plot_summary(&summary, &out)?;
            for bar in &bars {
                println!(
                    "{:<24} robust={:.3} misaligned={:.3} incorrect={:.3}",
                    bar.label, bar.robust, bar.misaligned, bar.incorrect
                );
            }
            println!("{}", out.display());
            Ok(())
        }
        Commands::PlotFirstLetter { results, out } => {
            let bar = plot::plot_first_letter(&results, &out)?;
            println!(
                "robust_correct={:.3} misaligned={:.3} incorrect={:.3}",
                bar.robust, bar.misaligned, bar.incorrect
            );
            println!("{}", out.display());
            Ok(())
        }
    }
}

fn generate_dataset(out: &Path, spec: DatasetSpec) -> Result<()> {
    tracing::info!(
        n = spec.n,
        min = spec.min,
        max = spec.max,
        seed = spec.seed,
        "Generating dataset"
    );
    let questions = dataset::generate_questions(&spec)?;
    dataset::write_questions(out, &questions)
        .with_context(|| format!("writing {}", out.display()))?;
    println!("{}", out.display());
    Ok(())
}

fn generate_words(corpus: &Path, out: &Path, count: usize, top: usize) -> Result<()> {
    let list = words::build_word_list(corpus, top, count)
        .with_context(|| format!("reading corpus {}", corpus.display()))?;
    words::write_word_list(out, &list).with_context(|| format!("writing {}", out.display()))?;
    let sample: Vec<&str> = list.iter().take(10).map(String::as_str).collect();
    println!("{} words, e.g. {}", list.len(), sample.join(", "));
    println!("{}", out.display());
    Ok(())
}

fn run_arithmetic(
    dataset_path: &Path,
    variant: PromptVariant,
    out: Option<PathBuf>,
    model: &ModelArgs,
) -> Result<()> {
    let config = model.load_config(ConfigOverrides::default())?;
    let prompts = config.load_prompts(variant)?;
    let questions = dataset::load_questions(dataset_path)
        .with_context(|| format!("loading dataset {}", dataset_path.display()))?;
    let caller = ModelCaller::from_config(&config).context("creating model backend")?;

    let runner = ArithmeticRunner::new(&caller, &config, variant, prompts);
    let out = out.unwrap_or_else(|| {
        PathBuf::from("runs").join(format!("{}_{}.csv", runner.run_id(), variant))
    });
    let results = runner.run(&questions);

    records::write_csv(&out, &results).with_context(|| format!("writing {}", out.display()))?;
    println!("{}", out.display());
    println!(
        "{}",
        CategoryTally::from_categories(results.iter().map(records::ArithmeticRecord::category))
    );
    Ok(())
}

fn run_first_letter(words_path: &Path, out: &Path, model: &ModelArgs) -> Result<()> {
    let config = model.load_config(ConfigOverrides {
        temperature: Some(FIRST_LETTER_TEMPERATURE),
        max_tokens: Some(FIRST_LETTER_MAX_TOKENS),
        ..ConfigOverrides::default()
    })?;
    let list = words::load_word_list(words_path)
        .with_context(|| format!("loading words {}", words_path.display()))?;
    let caller = ModelCaller::from_config(&config).context("creating model backend")?;

    tracing::info!(model = %config.model, path = %words_path.display(), "Running first-letter task");
    let results = FirstLetterRunner::new(&caller).run(&list);

    records::write_csv(out, &results).with_context(|| format!("writing {}", out.display()))?;
    println!("{}", out.display());
    println!(
        "{}",
        CategoryTally::from_categories(results.iter().map(|r| r.category))
    );
    Ok(())
}

fn score(response: &str, word: Option<&str>, answer: Option<i64>) {
    if let Some(word) = word {
        let s = score_first_letter(word, response);
        println!("expected:              {}", s.expected);
        println!("is_single_lower_alpha: {}", s.is_single_lower_alpha);
        println!("correct_letter:        {}", s.correct_letter);
        println!("category:              {}", s.category);
    } else {
        let s = score_arithmetic(response, answer);
        println!("naive_eval_pass:  {}", s.naive_pass);
        println!("robust_eval_pass: {}", s.robust_pass);
        println!(
            "parsed:           {}",
            s.parsed.map_or_else(|| "-".to_string(), |v| v.to_string())
        );
        println!("misaligned:       {}", s.misaligned);
        println!("category:         {}", s.category);
    }
}

fn aggregate_runs(
    pattern: &str,
    out_table: &Path,
    out_figure: Option<&Path>,
    out_report: Option<&Path>,
) -> Result<()> {
    // Reject an unknown report extension before any output is written
    if let Some(report_path) = out_report {
        ReportFormat::from_path(report_path)?;
    }

    let aggregation = aggregate::aggregate_runs(pattern)?;
    records::write_csv(out_table, &aggregation.summary)
        .with_context(|| format!("writing {}", out_table.display()))?;
    print_summary(&aggregation.summary);
    println!("{}", out_table.display());

    if let Some(figure) = out_figure {
        let bars = plot::summary_breakdowns(&aggregation.summary);
        plot::render_stacked_bars(figure, "Outcomes by prompt variant", &bars)?;
        println!("{}", figure.display());
    }

    if let Some(report_path) = out_report {
        ReportBuilder::new("Misalignment probe report")
            .build(&aggregation)
            .write(report_path)
            .with_context(|| format!("writing {}", report_path.display()))?;
        println!("{}", report_path.display());
    }
    Ok(())
}

fn print_summary(summary: &[SummaryRecord]) {
    for s in summary {
        println!(
            "{:<20} {:<8} n={:<5} naive={:.3} robust={:.3} misaligned={:.3} latency={:.0}ms",
            s.model,
            s.prompt_variant,
            s.n,
            s.naive_acc,
            s.robust_acc,
            s.misaligned_rate,
            s.avg_latency_ms
        );
    }
}

// # Command Line Options
//
// Hand-rolled short/long option parsing into an ordered op list. Order
// matters: a snapshot load applies its globals when it appears, and every
// option after it takes precedence over the loaded values.

use crate::engine::forest::SAMPLES_MIN;
use crate::error::{GroveError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Decimals(usize),
    IgnoreDims(String),
    IncludeDims(String),
    Trees(usize),
    Samples(usize),
    InputSeparator(u8),
    Learn(String),
    Analyze(String),
    Categorize(String),
    Template(String),
    DimensionTemplate(String),
    Score(String),
    SaveForest(String),
    LoadForest(String),
    InplaceForest(String),
    CategoryDims(String),
    LabelDims(String),
    Header,
    SetLocale,
    Output(String),
    Filter(String),
    Test(Option<f64>),
    TestInterval(usize),
    UniqueSamples(Option<u32>),
    PrintfFormat(String),
    ListSeparator(u8),
    Missing(Option<String>),
    DeleteInterval(i64),
    NewFormat(Option<String>),
    Aggregate,
    TextDims(String),
    ScoreDims(String),
    Query,
    Density { common_scale: bool },
    SampleScores,
    RemoveOutlier,
    RcFile(String),
    Correlation,
    Average(Option<String>),
    ResetForest(String),
    Expression(String),
    Seed(u64),
    Help,
    Version,
}

/// Seconds per unit for the delete-interval suffixes.
fn interval_unit(suffix: u8) -> Option<i64> {
    match suffix {
        b'Y' | b'y' => Some(31_556_926),
        b'M' => Some(2_629_743),
        b'D' | b'd' => Some(86_400),
        b'm' => Some(60),
        b's' => Some(1),
        b'0'..=b'9' => Some(1),
        _ => None,
    }
}

/// Parse a forest age such as `30d` or `12M` into seconds.
pub fn parse_delete_interval(spec: &str) -> Result<i64> {
    let digits: String = spec
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '-')
        .collect();
    let value: i64 = digits.parse().unwrap_or(0);
    let last = spec.bytes().last().unwrap_or(0);
    let unit = interval_unit(last);
    if value <= 0 || unit.is_none() {
        return Err(GroveError::InvalidOption(format!(
            "invalid time format for old forest data deletion: {}",
            spec
        )));
    }
    Ok(value * unit.unwrap())
}

struct ArgStream<'a> {
    args: &'a [String],
    pos: usize,
}

impl<'a> ArgStream<'a> {
    /// Required option value: attached (`-d6`, `--decimals=6`) or the next
    /// argument.
    fn required(&mut self, attached: Option<&str>, name: &str) -> Result<String> {
        if let Some(v) = attached {
            return Ok(v.to_string());
        }
        let v = self.args.get(self.pos).cloned();
        match v {
            Some(v) => {
                self.pos += 1;
                Ok(v)
            }
            None => Err(GroveError::InvalidOption(format!(
                "option '{}' requires a value",
                name
            ))),
        }
    }
}

fn number<T: std::str::FromStr>(value: &str, name: &str) -> Result<T> {
    value.parse().map_err(|_| {
        GroveError::InvalidOption(format!("bad value for option '{}': {}", name, value))
    })
}

fn separator_byte(value: &str, name: &str) -> Result<u8> {
    value
        .bytes()
        .next()
        .ok_or_else(|| GroveError::InvalidOption(format!("empty value for option '{}'", name)))
}

/// Parse the argument list into ordered ops.
pub fn parse_args(args: &[String]) -> Result<Vec<Op>> {
    let mut ops = Vec::new();
    let mut stream = ArgStream { args, pos: 0 };

    while stream.pos < args.len() {
        let arg = args[stream.pos].clone();
        stream.pos += 1;

        let (name, attached): (String, Option<String>) = if let Some(long) = arg.strip_prefix("--")
        {
            match long.split_once('=') {
                Some((n, v)) => (format!("--{}", n), Some(v.to_string())),
                None => (arg.clone(), None),
            }
        } else if arg.len() > 2 && arg.starts_with('-') {
            (arg[..2].to_string(), Some(arg[2..].to_string()))
        } else {
            (arg.clone(), None)
        };
        let attached_ref = attached.as_deref();

        let op = match name.as_str() {
            "-d" | "--decimals" => {
                Op::Decimals(number(&stream.required(attached_ref, &name)?, &name)?)
            }
            "-I" | "--ignore-dims" => Op::IgnoreDims(stream.required(attached_ref, &name)?),
            "-U" | "--use-dims" | "--include-dims" => {
                Op::IncludeDims(stream.required(attached_ref, &name)?)
            }
            "-t" | "--trees" => {
                let trees: usize = number(&stream.required(attached_ref, &name)?, &name)?;
                if trees < 2 {
                    return Err(GroveError::InvalidOption(
                        "tree count less than two makes no sense".to_string(),
                    ));
                }
                Op::Trees(trees)
            }
            "-s" | "--samples" => {
                let samples: usize = number(&stream.required(attached_ref, &name)?, &name)?;
                if samples < SAMPLES_MIN {
                    return Err(GroveError::InvalidOption(
                        "low sample count makes no sense".to_string(),
                    ));
                }
                Op::Samples(samples)
            }
            "-f" | "--input-separator" => {
                Op::InputSeparator(separator_byte(&stream.required(attached_ref, &name)?, &name)?)
            }
            "-l" | "--learn" => Op::Learn(stream.required(attached_ref, &name)?),
            "-a" | "--analyze" => Op::Analyze(stream.required(attached_ref, &name)?),
            "-c" | "--categorize" => Op::Categorize(stream.required(attached_ref, &name)?),
            "-p" | "--print" => Op::Template(stream.required(attached_ref, &name)?),
            "-j" | "--print-dimension" => {
                Op::DimensionTemplate(stream.required(attached_ref, &name)?)
            }
            "-O" | "--outlier-score" => Op::Score(stream.required(attached_ref, &name)?),
            "-w" | "--write-forest" => Op::SaveForest(stream.required(attached_ref, &name)?),
            "-r" | "--read-forest" => Op::LoadForest(stream.required(attached_ref, &name)?),
            "-z" | "--inplace-forest" => Op::InplaceForest(stream.required(attached_ref, &name)?),
            "-C" | "--category-dim" => Op::CategoryDims(stream.required(attached_ref, &name)?),
            "-L" | "--label-dim" => Op::LabelDims(stream.required(attached_ref, &name)?),
            "-H" | "--header" => Op::Header,
            "-S" | "--set-locale" => Op::SetLocale,
            "-o" | "--output" => Op::Output(stream.required(attached_ref, &name)?),
            "-F" | "--category-filter" => Op::Filter(stream.required(attached_ref, &name)?),
            "-T" | "--test" => Op::Test(match attached_ref {
                Some(v) => Some(number(v, &name)?),
                None => None,
            }),
            "-i" | "--test-interval" => {
                Op::TestInterval(number(&stream.required(attached_ref, &name)?, &name)?)
            }
            "-u" | "--unique-samples" => {
                let percent = match attached_ref {
                    Some(v) => {
                        let p: u32 = number(v, &name)?;
                        if p > 100 {
                            return Err(GroveError::InvalidOption(
                                "give unique sample percent between 0 and 100".to_string(),
                            ));
                        }
                        Some(p)
                    }
                    None => None,
                };
                Op::UniqueSamples(percent)
            }
            "-m" | "--printf-format" => Op::PrintfFormat(stream.required(attached_ref, &name)?),
            "-e" | "--list-separator" => {
                Op::ListSeparator(separator_byte(&stream.required(attached_ref, &name)?, &name)?)
            }
            "-M" | "--missing" => Op::Missing(attached.clone()),
            "-D" | "--delete" => Op::DeleteInterval(parse_delete_interval(
                &stream.required(attached_ref, &name)?,
            )?),
            "-N" | "--new" => Op::NewFormat(attached.clone()),
            "-A" | "--aggregate" => Op::Aggregate,
            "-X" | "--text-dims" => Op::TextDims(stream.required(attached_ref, &name)?),
            "-G" | "--score-dims" => Op::ScoreDims(stream.required(attached_ref, &name)?),
            "-q" | "--query" => Op::Query,
            "-y" | "--sample-density" => Op::Density {
                common_scale: attached_ref == Some("y"),
            },
            "-E" | "--sample-scores" => Op::SampleScores,
            "-k" | "--remove-outlier" => Op::RemoveOutlier,
            "-g" | "--rc-file" => Op::RcFile(stream.required(attached_ref, &name)?),
            "-P" | "--correlation-coe" => Op::Correlation,
            "-v" | "--average" => Op::Average(attached.clone()),
            "-R" | "--reset-forest" => Op::ResetForest(stream.required(attached_ref, &name)?),
            "-x" | "--expression" => Op::Expression(stream.required(attached_ref, &name)?),
            "--seed" => Op::Seed(number(&stream.required(attached_ref, &name)?, &name)?),
            "-h" | "--help" => Op::Help,
            "-V" | "--version" => Op::Version,
            other => {
                return Err(GroveError::InvalidOption(format!(
                    "unknown option '{}'",
                    other
                )))
            }
        };
        ops.push(op);
    }
    Ok(ops)
}

pub const USAGE: &str = "\
grove - categorized extended isolation forest tool
Usage: grove [OPTION]...
Options:
  -d, --decimals INTEGER       number of decimals when printing and saving dimension values
  -h, --help                   display this help and exit
  -V, --version                output version information and exit
  -I, --ignore-dims LIST       comma separated list of dimensions not to be used, first is number 1. Ranges can be given using dash
  -U, --use-dims LIST          comma separated list of dimensions to be used. Overrides entries from -I option
  -t, --trees INTEGER          number of trees. Default is 100
  -s, --samples INTEGER        number of samples/tree. Default is 256
  -f, --input-separator CHAR   input file field separator. Default is comma
  -l, --learn FILE             file to be used for training
  -a, --analyze FILE           file to analyze
  -c, --categorize FILE        file to categorize
  -p, --print STRING           outlier printing format
  -j, --print-dimension STRING sub-format for the %m printing directive
  -o, --output FILE            outlier data is printed to FILE. Default is stdout
  -w, --write-forest FILE      write forest data to FILE (.json extension selects the object format)
  -O, --outlier-score SPEC     plain value in 0..1, value with suffix 's' for scaled scores, or 0..100 with suffix '%' for a percentile threshold
  -r, --read-forest FILE       read forest data from FILE
  -z, --inplace-forest FILE    read forest data from FILE and write it back after processing
  -C, --category-dim LIST      comma separated list of dimensions to form a category string
  -L, --label-dim LIST         comma separated list of dimensions to form a label string
  -H, --header                 input data file has a header
  -S, --set-locale             locale information is read from environment
  -T, --test[FLOAT]            generate test data with range extension factor FLOAT
  -i, --test-interval INTEGER  number of test points for each dimension, default is 256. Used with option -T
  -F, --category-filter REGEXP regular expression to filter categories. Several can be given. A leading \"-v \" inverts the match
  -u, --unique-samples[INT]    percent of samples checked for uniqueness, default 10 when no value is attached
  -m, --printf-format STRING   printf format string for dimension and average value printing
  -e, --list-separator CHAR    value separator for dimension and average value printing
  -M, --missing[STRING]        print categories not seen during analysis, using optional format STRING
  -D, --delete AGE             when saving, skip forests not updated within AGE (suffix y/M/d/m/s)
  -N, --new[STRING]            print records which do not match any known category, using optional format STRING
  -A, --aggregate              aggregate new samples by adding values component-wise per forest
  -X, --text-dims LIST         comma separated list of dimensions holding text values
  -G, --score-dims LIST        dimension attribute indices which must score high along the total score
  -q, --query                  print forest info and exit
  -y, --sample-density         print ascii density map of forest sample values and exit (-yy for a common scale)
  -E, --sample-scores          print sample values with sample score and exit
  -k, --remove-outlier         remove the sample having the largest outlier score, once per occurrence
  -g, --rc-file FILE           read global settings from FILE (default is ~/.groverc)
  -P, --correlation-coe        print correlation coefficients for every dimension pair and exit
  -v, --average[STRING]        print average info for each forest after analysis
  -R, --reset-forest STRING    remove all samples from the forest with category STRING
  -x, --expression STRING      field rewrite formula '$n = expr', a leading '-' removes it
      --seed INTEGER           seed the random source for reproducible runs
";

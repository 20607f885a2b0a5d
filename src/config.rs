// Copyright 2018-2026 optsearch developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! # Configuration
//!
//! The YAML configuration drives an entire run: which scripts to execute,
//! how long to give them, the acceptable experimental error, the signal that
//! requests a clean stop, and the set of compiler flags that spans the
//! search space.
//!
//! ```yaml
//! quit-signal: SIGUSR1
//! clean-script: ./clean.sh
//! build-script: ./build.sh
//! accuracy-test: ./accuracy.sh
//! performance-test: ./bench.sh
//! timeout: 300
//! benchmark-timeout: 120
//! benchmark-repeats: 20
//! epsilon: 5.0
//! compiler:
//!   name: gcc
//!   version: "7.2.0"
//!   flags:
//!     - name: unroll-loops
//!       type: on-off
//!       prefix: "-f"
//!       off-prefix: "-fno-"
//! ```
//!
//! Raw records are deserialized with `serde_yaml` and then validated into
//! [`Flag`] values; a malformed flag is reported with a message naming the
//! flag and the missing field.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::error::{OptError, Result};

fn default_timeout() -> u64 {
    120
}

fn default_benchmark_repeats() -> u32 {
    20
}

fn default_epsilon() -> f64 {
    5.0
}

/// Everything a run needs to know, parsed from the YAML file handed to
/// `-c/--conf`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct SearchConfig {
    /// Signal name requesting a clean stop (e.g. `SIGUSR1`).
    pub quit_signal: String,
    /// Command run before each build to reset the tree.
    pub clean_script: String,
    /// Command that builds the benchmark under the candidate flags.
    pub build_script: String,
    /// Correctness gate; a non-zero exit discards the candidate.
    pub accuracy_test: String,
    /// The benchmark whose wall-clock time is the fitness.
    pub performance_test: String,
    /// Per-step timeout (seconds) for clean/build/accuracy.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Per-run timeout (seconds) for the benchmark.
    #[serde(default = "default_timeout")]
    pub benchmark_timeout: u64,
    /// Maximum benchmark repetitions per evaluation. Zero means one run.
    #[serde(default = "default_benchmark_repeats")]
    pub benchmark_repeats: u32,
    /// Acceptable experimental error, as a percentage.
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    /// Compiler description and flag list.
    #[serde(default)]
    pub compiler: CompilerConfig,
}

/// The `compiler:` section. Name and version are diagnostic only.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct CompilerConfig {
    pub name: Option<String>,
    pub version: Option<String>,
    #[serde(default)]
    pub flags: Vec<FlagRecord>,
}

/// One flag record as written in the YAML, prior to validation.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FlagRecord {
    /// The part passed to the compiler, e.g. the `unroll-loops` of
    /// `-funroll-loops`.
    pub name: String,
    /// `on-off`, `range` or `list`.
    #[serde(rename = "type")]
    pub flag_type: String,
    /// E.g. `-f` or `--param ` (note the possible trailing space).
    pub prefix: String,
    /// For on-off flags: e.g. the `-fno-` of `-fno-unroll-loops`.
    #[serde(default)]
    pub off_prefix: Option<String>,
    /// For range and list flags, usually `=` or a space.
    #[serde(default)]
    pub separator: Option<String>,
    #[serde(default)]
    pub min: Option<i64>,
    #[serde(default)]
    pub max: Option<i64>,
    #[serde(default)]
    pub default: Option<i64>,
    /// For list flags. Often strings like `on`, `off`, `fast`.
    #[serde(default)]
    pub values: Option<Vec<String>>,
    /// Only for readability of the YAML.
    #[serde(default)]
    pub description: Option<String>,
    /// Parsed and logged, but dependencies do not affect the search.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub depended_on_by: Vec<String>,
}

/// A validated compiler flag. Each flag spans exactly one search dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct Flag {
    /// Index of the flag in the configuration; doubles as the dimension uid.
    pub uid: i64,
    pub name: String,
    pub prefix: String,
    pub kind: FlagKind,
}

/// Type-specific flag data. A tagged variant, not a class hierarchy.
#[derive(Debug, Clone, PartialEq)]
pub enum FlagKind {
    /// Either `{prefix}{name}` or `{off_prefix}{name}`.
    OnOff { off_prefix: String },
    /// `{prefix}{name}{separator}{value}` for an integer value.
    Range {
        separator: Option<String>,
        min: i64,
        max: i64,
        default: Option<i64>,
    },
    /// `{prefix}{name}{separator}{values[i]}`.
    List {
        separator: Option<String>,
        values: Vec<String>,
    },
}

impl Flag {
    /// Validate every record, assigning uids in declaration order.
    pub fn from_records(records: &[FlagRecord]) -> Result<Vec<Flag>> {
        records
            .iter()
            .enumerate()
            .map(|(uid, record)| Flag::from_record(uid as i64, record))
            .collect()
    }

    fn from_record(uid: i64, record: &FlagRecord) -> Result<Flag> {
        if !record.depends_on.is_empty() || !record.depended_on_by.is_empty() {
            debug!(
                flag = %record.name,
                depends_on = ?record.depends_on,
                depended_on_by = ?record.depended_on_by,
                "flag dependencies are recorded but do not affect the search"
            );
        }
        let kind = match record.flag_type.as_str() {
            "on-off" | "onoff" => FlagKind::OnOff {
                off_prefix: record.off_prefix.clone().ok_or_else(|| {
                    OptError::config(format!(
                        "on-off flag '{}' is missing its off-prefix",
                        record.name
                    ))
                })?,
            },
            "range" => FlagKind::Range {
                separator: record.separator.clone(),
                min: record.min.ok_or_else(|| {
                    OptError::config(format!("range flag '{}' is missing min", record.name))
                })?,
                max: record.max.ok_or_else(|| {
                    OptError::config(format!("range flag '{}' is missing max", record.name))
                })?,
                default: record.default,
            },
            "list" => {
                let values = record.values.clone().ok_or_else(|| {
                    OptError::config(format!("list flag '{}' is missing values", record.name))
                })?;
                if values.is_empty() {
                    return Err(OptError::config(format!(
                        "list flag '{}' has an empty value list",
                        record.name
                    )));
                }
                FlagKind::List {
                    separator: record.separator.clone(),
                    values,
                }
            }
            other => {
                return Err(OptError::config(format!(
                    "flag '{}' has unrecognised type '{}' (expected on-off, range or list)",
                    record.name, other
                )))
            }
        };
        Ok(Flag {
            uid,
            name: record.name.clone(),
            prefix: record.prefix.clone(),
            kind,
        })
    }

    /// Numeric tag stored in the flag table, matching the order the
    /// configuration reader has always used: range 1, list 2, on-off 3.
    pub fn type_tag(&self) -> i64 {
        match self.kind {
            FlagKind::Range { .. } => 1,
            FlagKind::List { .. } => 2,
            FlagKind::OnOff { .. } => 3,
        }
    }
}

impl SearchConfig {
    /// Read and parse the YAML configuration at `path`.
    pub fn from_file(path: &Path) -> Result<SearchConfig> {
        let text = fs::read_to_string(path).map_err(|e| {
            OptError::config(format!("cannot read config file {}: {}", path.display(), e))
        })?;
        SearchConfig::from_str(&text)
            .map_err(|e| OptError::config(format!("{}: {}", path.display(), e)))
    }

    fn from_str(text: &str) -> std::result::Result<SearchConfig, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    /// Validated flags for the whole configuration.
    pub fn flags(&self) -> Result<Vec<Flag>> {
        Flag::from_records(&self.compiler.flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
quit-signal: SIGUSR1
clean-script: ./clean.sh
build-script: ./build.sh
accuracy-test: ./accuracy.sh
performance-test: ./bench.sh
timeout: 300
benchmark-timeout: 60
benchmark-repeats: 10
epsilon: 2.5
compiler:
  name: gcc
  version: "7.2.0"
  flags:
    - name: unroll-loops
      type: on-off
      prefix: "-f"
      off-prefix: "-fno-"
    - name: max-unroll-times
      type: range
      prefix: "--param "
      separator: "="
      min: 0
      max: 32
      default: 8
    - name: fp-contract
      type: list
      prefix: "-f"
      separator: "="
      values: ["off", "on", "fast"]
      depends-on: ["unroll-loops"]
"#;

    #[test]
    fn parses_a_full_config() {
        let config: SearchConfig = serde_yaml::from_str(FULL).unwrap();
        assert_eq!(config.quit_signal, "SIGUSR1");
        assert_eq!(config.timeout, 300);
        assert_eq!(config.benchmark_timeout, 60);
        assert_eq!(config.benchmark_repeats, 10);
        assert_eq!(config.epsilon, 2.5);
        assert_eq!(config.compiler.name.as_deref(), Some("gcc"));
        assert_eq!(config.compiler.flags.len(), 3);
    }

    #[test]
    fn defaults_apply_when_keys_are_absent() {
        let config: SearchConfig = serde_yaml::from_str(
            r#"
quit-signal: SIGUSR1
clean-script: ./clean.sh
build-script: ./build.sh
accuracy-test: ./accuracy.sh
performance-test: ./bench.sh
"#,
        )
        .unwrap();
        assert_eq!(config.timeout, 120);
        assert_eq!(config.benchmark_timeout, 120);
        assert_eq!(config.benchmark_repeats, 20);
        assert_eq!(config.epsilon, 5.0);
        assert!(config.compiler.flags.is_empty());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = serde_yaml::from_str::<SearchConfig>(
            r#"
quit-signal: SIGUSR1
clean-script: ./clean.sh
build-script: ./build.sh
accuracy-test: ./accuracy.sh
performance-test: ./bench.sh
no-such-key: true
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("no-such-key"));
    }

    #[test]
    fn flags_validate_into_kinds() {
        let config: SearchConfig = serde_yaml::from_str(FULL).unwrap();
        let flags = config.flags().unwrap();
        assert_eq!(flags[0].uid, 0);
        assert!(matches!(flags[0].kind, FlagKind::OnOff { .. }));
        assert!(
            matches!(flags[1].kind, FlagKind::Range { min: 0, max: 32, default: Some(8), .. })
        );
        match &flags[2].kind {
            FlagKind::List { values, .. } => assert_eq!(values.len(), 3),
            other => panic!("expected a list flag, got {other:?}"),
        }
    }

    #[test]
    fn onoff_alias_is_accepted() {
        let record: FlagRecord = serde_yaml::from_str(
            r#"
name: unroll-loops
type: onoff
prefix: "-f"
off-prefix: "-fno-"
"#,
        )
        .unwrap();
        let flag = Flag::from_record(0, &record).unwrap();
        assert!(matches!(flag.kind, FlagKind::OnOff { .. }));
        assert_eq!(flag.type_tag(), 3);
    }

    #[test]
    fn malformed_flags_name_the_problem() {
        let record: FlagRecord = serde_yaml::from_str(
            r#"
name: unroll-loops
type: on-off
prefix: "-f"
"#,
        )
        .unwrap();
        let err = Flag::from_record(0, &record).unwrap_err();
        assert!(err.to_string().contains("unroll-loops"));
        assert!(err.to_string().contains("off-prefix"));

        let record: FlagRecord = serde_yaml::from_str(
            r#"
name: width
type: range
prefix: "-f"
min: 1
"#,
        )
        .unwrap();
        let err = Flag::from_record(0, &record).unwrap_err();
        assert!(err.to_string().contains("missing max"));

        let record: FlagRecord = serde_yaml::from_str(
            r#"
name: width
type: mystery
prefix: "-f"
"#,
        )
        .unwrap();
        let err = Flag::from_record(0, &record).unwrap_err();
        assert!(err.to_string().contains("unrecognised type"));
    }
}

use std::cmp::Ordering;

use serde::Serialize;

use crate::sheet::{Metric, NormalizedSheet, PassStage, StageTags, StudentRecord, METRICS};

pub const BIN_COUNT: usize = 10;
const NEARBY_BEFORE: usize = 2;
const NEARBY_AFTER: usize = 3;
const DISCOVERY_SAMPLE: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisError {
    pub code: String,
    pub message: String,
}

impl AnalysisError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn structure(sheet: &str, detail: &str) -> Self {
        Self::new("sheet_structure", format!("sheet {sheet}: {detail}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StagePair {
    pub first: bool,
    pub second: bool,
}

impl StagePair {
    pub fn all() -> Self {
        Self {
            first: true,
            second: true,
        }
    }

    pub fn admits(self, stage: Option<PassStage>) -> bool {
        match stage {
            Some(PassStage::FirstDemo) => self.first,
            Some(PassStage::SecondDemo) => self.second,
            None => false,
        }
    }

    pub fn is_empty(self) -> bool {
        !self.first && !self.second
    }
}

/// User-selected inclusion switches: one pair for ordinary sheets, two
/// independent pairs for the two-row-header sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Filter {
    Single(StagePair),
    Dual { design: StagePair, pattern: StagePair },
}

impl Filter {
    pub fn all_for(two_row_header: bool) -> Filter {
        if two_row_header {
            Filter::Dual {
                design: StagePair::all(),
                pattern: StagePair::all(),
            }
        } else {
            Filter::Single(StagePair::all())
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedEntry {
    pub account: String,
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<PassStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub design_pass: Option<PassStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern_pass: Option<PassStage>,
    pub rank: usize,
    pub is_target: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bin {
    pub range: String,
    pub min: f64,
    pub max: f64,
    pub count: usize,
    pub contains_target: bool,
}

/// One immutable snapshot per run; recomputed from scratch on every input
/// change and replaced atomically.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub sheet: String,
    pub metric: Metric,
    pub target: RankedEntry,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lab_score: Option<f64>,
    pub rank: usize,
    pub total_count: usize,
    pub percentile: f64,
    pub nearby: Vec<RankedEntry>,
    pub all_ranked: Vec<RankedEntry>,
    pub bins: Vec<Bin>,
    pub available_metrics: Vec<Metric>,
}

#[derive(Debug, Clone)]
struct Ranking {
    entries: Vec<RankedEntry>,
    nearby: Vec<RankedEntry>,
    rank: usize,
    total: usize,
    percentile: f64,
}

/// Metric columns actually present in this sheet: union of fields over the
/// first records, intersected with the known list in declared order.
pub fn discover_metrics(records: &[StudentRecord]) -> Vec<Metric> {
    let sample = &records[..records.len().min(DISCOVERY_SAMPLE)];
    METRICS
        .iter()
        .copied()
        .filter(|m| sample.iter().any(|r| r.metrics.contains_key(m)))
        .collect()
}

/// A selection that is not available degrades to the first discovered
/// metric rather than dangling.
pub fn select_metric(
    available: &[Metric],
    requested: Option<Metric>,
) -> Result<Metric, AnalysisError> {
    if available.is_empty() {
        return Err(AnalysisError::new(
            "no_metrics",
            "no metric columns found in this sheet",
        ));
    }
    match requested {
        Some(m) if available.contains(&m) => Ok(m),
        _ => Ok(available[0]),
    }
}

pub fn filter_records<'a>(
    records: &'a [StudentRecord],
    filter: &Filter,
    metric: Metric,
) -> Result<Vec<&'a StudentRecord>, AnalysisError> {
    match filter {
        Filter::Single(pair) => {
            if pair.is_empty() {
                return Err(AnalysisError::new(
                    "bad_filters",
                    "at least one demo stage must be selected",
                ));
            }
        }
        Filter::Dual { design, pattern } => {
            if design.is_empty() || pattern.is_empty() {
                return Err(AnalysisError::new(
                    "bad_filters",
                    "at least one demo stage must be selected for each pass gate",
                ));
            }
        }
    }

    Ok(records
        .iter()
        .filter(|r| {
            let stage_ok = match (filter, r.stages) {
                (Filter::Single(pair), StageTags::Single(stage)) => pair.admits(stage),
                (
                    Filter::Dual { design, pattern },
                    StageTags::Dual {
                        design: d,
                        pattern: p,
                    },
                ) => design.admits(d) && pattern.admits(p),
                _ => false,
            };
            stage_ok && r.metric(metric).map(f64::is_finite).unwrap_or(false)
        })
        .collect())
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn entry_from_record(r: &StudentRecord, metric: Metric, rank: usize, is_target: bool) -> RankedEntry {
    let (pass, design_pass, pattern_pass) = match r.stages {
        StageTags::Single(p) => (p, None, None),
        StageTags::Dual { design, pattern } => (None, design, pattern),
    };
    RankedEntry {
        account: r.account.clone(),
        value: r.metric(metric).unwrap_or(0.0),
        pass,
        design_pass,
        pattern_pass,
        rank,
        is_target,
    }
}

/// Lower is better for every metric: ascending sort, rank 1 = smallest.
/// Ties break on account so identical inputs always rank identically.
fn rank_records(
    filtered: &[&StudentRecord],
    metric: Metric,
    target_account: &str,
) -> Result<Ranking, AnalysisError> {
    let mut sorted: Vec<&StudentRecord> = filtered.to_vec();
    sorted.sort_by(|a, b| {
        let av = a.metric(metric).unwrap_or(f64::INFINITY);
        let bv = b.metric(metric).unwrap_or(f64::INFINITY);
        av.partial_cmp(&bv)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.account.cmp(&b.account))
    });

    let Some(target_index) = sorted.iter().position(|r| r.account == target_account) else {
        return Err(AnalysisError::new(
            "not_found",
            format!("student {target_account} not found under current filters"),
        ));
    };

    let total = sorted.len();
    let rank = target_index + 1;
    let percentile = round2(rank as f64 / total as f64 * 100.0);
    let entries: Vec<RankedEntry> = sorted
        .iter()
        .enumerate()
        .map(|(i, r)| entry_from_record(r, metric, i + 1, i == target_index))
        .collect();

    let start = target_index.saturating_sub(NEARBY_BEFORE);
    let end = (target_index + NEARBY_AFTER).min(total);
    let nearby = entries[start..end].to_vec();

    Ok(Ranking {
        entries,
        nearby,
        rank,
        total,
        percentile,
    })
}

fn format_bin_range(lo: f64, hi: f64, scale_max: f64) -> String {
    if scale_max > 1000.0 {
        format!("{:.1}k-{:.1}k", lo / 1000.0, hi / 1000.0)
    } else {
        format!("{:.1}-{:.1}", lo, hi)
    }
}

/// Ten equal-width bins over the filtered value range. Interior bounds are
/// half-open `[min, max)`; the final bin's upper bound is inclusive so the
/// counts sum to the filtered record count. A zero-width range puts every
/// record, and the target, in bin 0.
pub fn build_bins(values: &[f64], target_value: f64) -> Vec<Bin> {
    if values.is_empty() {
        return Vec::new();
    }
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let width = (max - min) / BIN_COUNT as f64;

    let mut bins: Vec<Bin> = (0..BIN_COUNT)
        .map(|i| {
            let lo = min + i as f64 * width;
            let hi = min + (i + 1) as f64 * width;
            Bin {
                range: format_bin_range(lo, hi, max),
                min: lo,
                max: hi,
                count: 0,
                contains_target: false,
            }
        })
        .collect();

    if width == 0.0 {
        bins[0].count = values.len();
        bins[0].contains_target = true;
        return bins;
    }

    for &v in values {
        if let Some(i) = bin_index(&bins, v) {
            bins[i].count += 1;
        }
    }
    if let Some(i) = bin_index(&bins, target_value) {
        bins[i].contains_target = true;
    }
    bins
}

// First match wins, scanned in bin order.
fn bin_index(bins: &[Bin], value: f64) -> Option<usize> {
    for (i, b) in bins.iter().enumerate() {
        let last = i == bins.len() - 1;
        if value >= b.min && (value < b.max || (last && value <= b.max)) {
            return Some(i);
        }
    }
    None
}

/// The whole pipeline as one pure function: normalize has already run, so
/// this is discover -> filter -> rank -> bin -> assemble. Any failure
/// yields a typed error and no partial result.
pub fn compute_analysis(
    sheet: &NormalizedSheet,
    filter: &Filter,
    requested_metric: Option<Metric>,
    target_account: &str,
) -> Result<AnalysisResult, AnalysisError> {
    let available = discover_metrics(&sheet.records);
    let metric = select_metric(&available, requested_metric)?;

    // Absent from the sheet and absent after filtering report distinctly.
    let Some(target_record) = sheet.records.iter().find(|r| r.account == target_account) else {
        return Err(AnalysisError::new(
            "not_found",
            format!("student {} not found in {}", target_account, sheet.name),
        ));
    };
    let lab_score = target_record.lab_score;

    let filtered = filter_records(&sheet.records, filter, metric)?;
    if filtered.is_empty() {
        return Err(AnalysisError::new(
            "empty_result",
            "no records match the selected filters",
        ));
    }

    let ranking = rank_records(&filtered, metric, target_account)?;
    let target = ranking.entries[ranking.rank - 1].clone();
    let values: Vec<f64> = ranking.entries.iter().map(|e| e.value).collect();
    let bins = build_bins(&values, target.value);

    Ok(AnalysisResult {
        sheet: sheet.name.clone(),
        metric,
        target,
        lab_score,
        rank: ranking.rank,
        total_count: ranking.total,
        percentile: ranking.percentile,
        nearby: ranking.nearby,
        all_ranked: ranking.entries,
        bins,
        available_metrics: available,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn single(account: &str, stage: Option<PassStage>, area: f64) -> StudentRecord {
        StudentRecord {
            account: account.to_string(),
            stages: StageTags::Single(stage),
            metrics: BTreeMap::from([(Metric::Area, area)]),
            lab_score: None,
        }
    }

    fn dual(
        account: &str,
        design: Option<PassStage>,
        pattern: Option<PassStage>,
        area: f64,
    ) -> StudentRecord {
        StudentRecord {
            account: account.to_string(),
            stages: StageTags::Dual { design, pattern },
            metrics: BTreeMap::from([(Metric::Area, area)]),
            lab_score: None,
        }
    }

    fn five_singles() -> Vec<StudentRecord> {
        [10.0, 20.0, 30.0, 40.0, 50.0]
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                single(
                    &format!("iclab00{}", i + 1),
                    Some(PassStage::FirstDemo),
                    v,
                )
            })
            .collect()
    }

    fn sheet_of(records: Vec<StudentRecord>) -> NormalizedSheet {
        NormalizedSheet {
            name: "Lab01".to_string(),
            two_row_header: false,
            records,
        }
    }

    #[test]
    fn rank_and_percentile_for_middle_target() {
        let sheet = sheet_of(five_singles());
        let filter = Filter::all_for(false);
        let result = compute_analysis(&sheet, &filter, Some(Metric::Area), "iclab003")
            .expect("analysis");
        assert_eq!(result.rank, 3);
        assert_eq!(result.total_count, 5);
        assert_eq!(result.percentile, 60.0);
        assert_eq!(result.target.account, "iclab003");
        assert!(result.target.is_target);
        assert_eq!(result.nearby.len(), 5);
        assert_eq!(
            result.nearby.iter().map(|e| e.rank).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5]
        );
    }

    #[test]
    fn nearby_window_clips_at_edges() {
        let sheet = sheet_of(five_singles());
        let filter = Filter::all_for(false);

        let first = compute_analysis(&sheet, &filter, Some(Metric::Area), "iclab001")
            .expect("analysis");
        assert_eq!(
            first.nearby.iter().map(|e| e.rank).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        let last = compute_analysis(&sheet, &filter, Some(Metric::Area), "iclab005")
            .expect("analysis");
        assert_eq!(
            last.nearby.iter().map(|e| e.rank).collect::<Vec<_>>(),
            vec![3, 4, 5]
        );
    }

    #[test]
    fn ranking_breaks_value_ties_by_account() {
        let records = vec![
            single("iclab009", Some(PassStage::FirstDemo), 10.0),
            single("iclab001", Some(PassStage::FirstDemo), 10.0),
            single("iclab005", Some(PassStage::FirstDemo), 10.0),
        ];
        let result = compute_analysis(
            &sheet_of(records),
            &Filter::all_for(false),
            Some(Metric::Area),
            "iclab005",
        )
        .expect("analysis");
        let accounts: Vec<&str> = result
            .all_ranked
            .iter()
            .map(|e| e.account.as_str())
            .collect();
        assert_eq!(accounts, vec!["iclab001", "iclab005", "iclab009"]);
        assert_eq!(result.rank, 2);
    }

    #[test]
    fn stage_filter_narrows_the_ranked_set() {
        let records = vec![
            single("iclab001", Some(PassStage::FirstDemo), 10.0),
            single("iclab002", Some(PassStage::SecondDemo), 20.0),
            single("iclab003", Some(PassStage::FirstDemo), 30.0),
            single("iclab004", None, 5.0),
        ];
        let filter = Filter::Single(StagePair {
            first: true,
            second: false,
        });
        let result = compute_analysis(&sheet_of(records), &filter, Some(Metric::Area), "iclab003")
            .expect("analysis");
        assert_eq!(result.total_count, 2);
        assert_eq!(result.rank, 2);
        assert_eq!(result.percentile, 100.0);
    }

    #[test]
    fn all_switches_off_is_a_configuration_error() {
        let filter = Filter::Single(StagePair {
            first: false,
            second: false,
        });
        let e = compute_analysis(
            &sheet_of(five_singles()),
            &filter,
            Some(Metric::Area),
            "iclab003",
        )
        .expect_err("bad filters");
        assert_eq!(e.code, "bad_filters");
    }

    #[test]
    fn dual_gates_must_both_admit() {
        let records = vec![
            dual(
                "iclab001",
                Some(PassStage::FirstDemo),
                Some(PassStage::FirstDemo),
                10.0,
            ),
            dual(
                "iclab002",
                Some(PassStage::FirstDemo),
                Some(PassStage::SecondDemo),
                20.0,
            ),
            dual(
                "iclab003",
                Some(PassStage::SecondDemo),
                Some(PassStage::FirstDemo),
                30.0,
            ),
        ];
        let mut sheet = sheet_of(records);
        sheet.two_row_header = true;
        let filter = Filter::Dual {
            design: StagePair::all(),
            pattern: StagePair {
                first: true,
                second: false,
            },
        };
        let result =
            compute_analysis(&sheet, &filter, Some(Metric::Area), "iclab001").expect("analysis");
        // iclab002 passes the design gate alone and must still be excluded.
        let accounts: Vec<&str> = result
            .all_ranked
            .iter()
            .map(|e| e.account.as_str())
            .collect();
        assert_eq!(accounts, vec!["iclab001", "iclab003"]);
    }

    #[test]
    fn dual_gate_with_no_stage_selected_is_a_configuration_error() {
        let mut sheet = sheet_of(vec![dual(
            "iclab001",
            Some(PassStage::FirstDemo),
            Some(PassStage::FirstDemo),
            10.0,
        )]);
        sheet.two_row_header = true;
        let filter = Filter::Dual {
            design: StagePair::all(),
            pattern: StagePair {
                first: false,
                second: false,
            },
        };
        let e = compute_analysis(&sheet, &filter, Some(Metric::Area), "iclab001")
            .expect_err("bad filters");
        assert_eq!(e.code, "bad_filters");
    }

    #[test]
    fn unavailable_metric_falls_back_to_first_discovered() {
        let result = compute_analysis(
            &sheet_of(five_singles()),
            &Filter::all_for(false),
            Some(Metric::Power),
            "iclab003",
        )
        .expect("analysis");
        assert_eq!(result.metric, Metric::Area);
        assert_eq!(result.available_metrics, vec![Metric::Area]);
    }

    #[test]
    fn discovery_preserves_declared_metric_order() {
        let mut records = five_singles();
        for r in &mut records {
            // Insert in reverse of the declared order; discovery must not care.
            r.metrics.insert(Metric::Performance, 1.0);
            r.metrics.insert(Metric::Latency, 2.0);
        }
        let discovered = discover_metrics(&records);
        assert_eq!(
            discovered,
            vec![Metric::Area, Metric::Latency, Metric::Performance]
        );
    }

    #[test]
    fn no_discovered_metrics_is_an_error() {
        let records = vec![StudentRecord {
            account: "iclab001".to_string(),
            stages: StageTags::Single(Some(PassStage::FirstDemo)),
            metrics: BTreeMap::new(),
            lab_score: None,
        }];
        let e = compute_analysis(
            &sheet_of(records),
            &Filter::all_for(false),
            None,
            "iclab001",
        )
        .expect_err("no metrics");
        assert_eq!(e.code, "no_metrics");
    }

    #[test]
    fn missing_target_reports_sheet_vs_filter_distinctly() {
        let records = vec![
            single("iclab001", Some(PassStage::FirstDemo), 10.0),
            single("iclab002", Some(PassStage::SecondDemo), 20.0),
        ];
        let sheet = sheet_of(records);

        let absent = compute_analysis(
            &sheet,
            &Filter::all_for(false),
            Some(Metric::Area),
            "iclab099",
        )
        .expect_err("absent from sheet");
        assert_eq!(absent.code, "not_found");
        assert!(absent.message.contains("Lab01"));

        let filtered_out = compute_analysis(
            &sheet,
            &Filter::Single(StagePair {
                first: true,
                second: false,
            }),
            Some(Metric::Area),
            "iclab002",
        )
        .expect_err("filtered out");
        assert_eq!(filtered_out.code, "not_found");
        assert!(filtered_out.message.contains("filters"));
    }

    #[test]
    fn empty_filtered_set_is_reported_as_such() {
        let records = vec![single("iclab001", None, 10.0)];
        let e = compute_analysis(
            &sheet_of(records),
            &Filter::all_for(false),
            Some(Metric::Area),
            "iclab001",
        )
        .expect_err("empty result");
        assert_eq!(e.code, "empty_result");
    }

    #[test]
    fn bin_counts_sum_to_filtered_count() {
        let records: Vec<StudentRecord> = (0..37)
            .map(|i| {
                single(
                    &format!("iclab{:03}", i + 1),
                    Some(PassStage::FirstDemo),
                    (i as f64) * 3.7 + 12.0,
                )
            })
            .collect();
        let result = compute_analysis(
            &sheet_of(records),
            &Filter::all_for(false),
            Some(Metric::Area),
            "iclab010",
        )
        .expect("analysis");
        assert_eq!(result.bins.len(), BIN_COUNT);
        let total: usize = result.bins.iter().map(|b| b.count).sum();
        assert_eq!(total, result.total_count);
        assert_eq!(
            result.bins.iter().filter(|b| b.contains_target).count(),
            1
        );
    }

    #[test]
    fn value_on_interior_boundary_falls_in_next_bin() {
        // Range [0, 10], width 1: a value of exactly 1.0 belongs to bin 1.
        let values: Vec<f64> = (0..=10).map(|i| i as f64).collect();
        let bins = build_bins(&values, 1.0);
        assert!(bins[1].contains_target);
        assert!(!bins[0].contains_target);
    }

    #[test]
    fn maximum_value_lands_in_final_bin() {
        let values: Vec<f64> = (0..=10).map(|i| i as f64).collect();
        let bins = build_bins(&values, 10.0);
        assert!(bins[BIN_COUNT - 1].contains_target);
        let total: usize = bins.iter().map(|b| b.count).sum();
        assert_eq!(total, values.len());
    }

    #[test]
    fn zero_width_range_collapses_into_bin_zero() {
        let values = vec![7.0; 4];
        let bins = build_bins(&values, 7.0);
        assert_eq!(bins.len(), BIN_COUNT);
        assert_eq!(bins[0].count, 4);
        assert!(bins[0].contains_target);
        assert!(bins[1..].iter().all(|b| b.count == 0 && !b.contains_target));
    }

    #[test]
    fn bin_labels_scale_to_k_above_one_thousand() {
        let values = vec![500.0, 1500.0, 2500.0];
        let bins = build_bins(&values, 500.0);
        assert_eq!(bins[0].range, "0.5k-0.7k");

        let small = build_bins(&[1.0, 2.0], 1.0);
        assert_eq!(small[0].range, "1.0-1.1");
    }

    #[test]
    fn identical_inputs_produce_identical_results() {
        let sheet = sheet_of(five_singles());
        let filter = Filter::all_for(false);
        let a = compute_analysis(&sheet, &filter, Some(Metric::Area), "iclab002").expect("a");
        let b = compute_analysis(&sheet, &filter, Some(Metric::Area), "iclab002").expect("b");
        assert_eq!(
            serde_json::to_string(&a).expect("json"),
            serde_json::to_string(&b).expect("json")
        );
    }

    #[test]
    fn percentile_rounds_to_two_decimals() {
        let records = vec![
            single("iclab001", Some(PassStage::FirstDemo), 1.0),
            single("iclab002", Some(PassStage::FirstDemo), 2.0),
            single("iclab003", Some(PassStage::FirstDemo), 3.0),
        ];
        let result = compute_analysis(
            &sheet_of(records),
            &Filter::all_for(false),
            Some(Metric::Area),
            "iclab002",
        )
        .expect("analysis");
        // 2/3 * 100 = 66.666... -> 66.67
        assert_eq!(result.percentile, 66.67);
    }
}

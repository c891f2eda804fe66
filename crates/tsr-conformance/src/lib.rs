#![forbid(unsafe_code)]

mod logging;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use tsr_api::{InProcessWorld, Session};
use tsr_core::{ArrayValue, DType, TypedArray, Value};
use tsr_dispatch::{BinaryOp, dispatch_binary};
use tsr_distributed::AllGather;
use tsr_kernel_cpu::{as_matrix, as_scalar, as_tensor, as_vector};
use tsr_primitive::{Binary, Classify, ErrorKind, PrimitiveGraph};
use tsr_serialize::{decode_value, encode_value};
use tsr_tiling::{TileInfo, TilingScheme, check_partition, tile_spans_for};

pub use logging::StructuredCaseLog;
use logging::replay_command;

const MAX_FIXTURE_BYTES: u64 = 1_048_576;

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub fixture_root: PathBuf,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        Self {
            fixture_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures"),
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessReport {
    pub suite: &'static str,
    pub fixture_count: usize,
    pub cases_total: usize,
    pub cases_passed: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastCaseReport {
    pub name: String,
    pub output_ok: bool,
    pub error_ok: bool,
    pub forensic_log: StructuredCaseLog,
}

impl BroadcastCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.output_ok && self.error_ok
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinaryCaseReport {
    pub name: String,
    pub output_ok: bool,
    pub kernel_ok: bool,
    pub error_ok: bool,
    pub forensic_log: StructuredCaseLog,
}

impl BinaryCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.output_ok && self.kernel_ok && self.error_ok
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TilingCaseReport {
    pub name: String,
    pub spans_ok: bool,
    pub partition_ok: bool,
    pub error_ok: bool,
    pub forensic_log: StructuredCaseLog,
}

impl TilingCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.spans_ok && self.partition_ok && self.error_ok
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CodecCaseReport {
    pub name: String,
    pub decode_ok: bool,
    pub deterministic_ok: bool,
    pub forensic_log: StructuredCaseLog,
}

impl CodecCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.decode_ok && self.deterministic_ok
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatherCaseReport {
    pub name: String,
    pub localities: usize,
    pub output_ok: bool,
    pub error_ok: bool,
    pub forensic_log: StructuredCaseLog,
}

impl GatherCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.output_ok && self.error_ok
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct FixtureArray {
    dtype: String,
    shape: Vec<usize>,
    data: Vec<JsonValue>,
}

#[derive(Debug, Clone, Deserialize)]
struct BroadcastFixtureFile {
    cases: Vec<BroadcastCase>,
}

#[derive(Debug, Clone, Deserialize)]
struct BroadcastCase {
    name: String,
    helper: String,
    input: FixtureArray,
    dims: Vec<usize>,
    expected: Option<FixtureArray>,
    expected_error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct BinaryFixtureFile {
    cases: Vec<BinaryCase>,
}

#[derive(Debug, Clone, Deserialize)]
struct BinaryCase {
    name: String,
    op: String,
    lhs: FixtureArray,
    rhs: FixtureArray,
    expected: Option<FixtureArray>,
    expected_kernel: Option<String>,
    expected_error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct TilingFixtureFile {
    cases: Vec<TilingCase>,
}

#[derive(Debug, Clone, Deserialize)]
struct TilingCase {
    name: String,
    scheme: String,
    shape: Vec<usize>,
    numtiles: usize,
    #[serde(default)]
    expected_spans: Vec<Vec<[usize; 2]>>,
    expected_error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct CodecFixtureFile {
    cases: Vec<CodecCase>,
}

#[derive(Debug, Clone, Deserialize)]
struct CodecCase {
    name: String,
    array: FixtureArray,
}

#[derive(Debug, Clone, Deserialize)]
struct GatherFixtureFile {
    cases: Vec<GatherCase>,
}

#[derive(Debug, Clone, Deserialize)]
struct GatherCase {
    name: String,
    scheme: String,
    tiles: Vec<FixtureArray>,
    expected: Option<FixtureArray>,
    expected_error: Option<String>,
}

/// Runs every suite and sums their cases; a suite whose fixture cannot be
/// loaded counts as zero cases.
pub fn run_smoke(config: &HarnessConfig) -> HarnessReport {
    let fixture_count = fs::read_dir(&config.fixture_root)
        .ok()
        .into_iter()
        .flat_map(|it| it.filter_map(Result::ok))
        .count();

    let totals = [
        run_broadcast_conformance(config).map_or((0, 0), |(report, _)| tally(&report)),
        run_binary_conformance(config).map_or((0, 0), |(report, _)| tally(&report)),
        run_tiling_conformance(config).map_or((0, 0), |(report, _)| tally(&report)),
        run_codec_conformance(config).map_or((0, 0), |(report, _)| tally(&report)),
        run_gather_conformance(config).map_or((0, 0), |(report, _)| tally(&report)),
    ];

    HarnessReport {
        suite: "smoke",
        fixture_count,
        cases_total: totals.iter().map(|(total, _)| total).sum(),
        cases_passed: totals.iter().map(|(_, passed)| passed).sum(),
    }
}

pub fn run_broadcast_conformance(
    config: &HarnessConfig,
) -> Result<(HarnessReport, Vec<BroadcastCaseReport>), String> {
    let fixture: BroadcastFixtureFile =
        load_fixture(&config.fixture_root.join("broadcast_cases.json"))?;
    let cases = fixture
        .cases
        .iter()
        .map(run_broadcast_case)
        .collect::<Result<Vec<_>, _>>()?;
    let report = suite_report("broadcast", cases.iter().map(BroadcastCaseReport::passed));
    Ok((report, cases))
}

pub fn run_binary_conformance(
    config: &HarnessConfig,
) -> Result<(HarnessReport, Vec<BinaryCaseReport>), String> {
    let fixture: BinaryFixtureFile = load_fixture(&config.fixture_root.join("binary_cases.json"))?;
    let cases = fixture
        .cases
        .iter()
        .map(run_binary_case)
        .collect::<Result<Vec<_>, _>>()?;
    let report = suite_report("binary_dispatch", cases.iter().map(BinaryCaseReport::passed));
    Ok((report, cases))
}

pub fn run_tiling_conformance(
    config: &HarnessConfig,
) -> Result<(HarnessReport, Vec<TilingCaseReport>), String> {
    let fixture: TilingFixtureFile = load_fixture(&config.fixture_root.join("tiling_cases.json"))?;
    let cases = fixture
        .cases
        .iter()
        .map(run_tiling_case)
        .collect::<Result<Vec<_>, _>>()?;
    let report = suite_report("tiling", cases.iter().map(TilingCaseReport::passed));
    Ok((report, cases))
}

pub fn run_codec_conformance(
    config: &HarnessConfig,
) -> Result<(HarnessReport, Vec<CodecCaseReport>), String> {
    let fixture: CodecFixtureFile = load_fixture(&config.fixture_root.join("codec_cases.json"))?;
    let cases = fixture
        .cases
        .iter()
        .map(run_codec_case)
        .collect::<Result<Vec<_>, _>>()?;
    let report = suite_report("codec", cases.iter().map(CodecCaseReport::passed));
    Ok((report, cases))
}

/// Each case runs in a fresh in-process world with one locality per tile.
pub fn run_gather_conformance(
    config: &HarnessConfig,
) -> Result<(HarnessReport, Vec<GatherCaseReport>), String> {
    let fixture: GatherFixtureFile = load_fixture(&config.fixture_root.join("gather_cases.json"))?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .map_err(|error| format!("failed starting async runtime: {error}"))?;
    let cases = fixture
        .cases
        .iter()
        .map(|case| runtime.block_on(run_gather_case(case)))
        .collect::<Result<Vec<_>, _>>()?;
    let report = suite_report("all_gather", cases.iter().map(GatherCaseReport::passed));
    Ok((report, cases))
}

fn run_broadcast_case(case: &BroadcastCase) -> Result<BroadcastCaseReport, String> {
    let input = case.input.to_array(&case.name)?;
    let dtype = input.dtype();
    let actual = match dtype {
        DType::Bool => broadcast_typed::<bool>(&case.helper, input, &case.dims),
        DType::Int64 => broadcast_typed::<i64>(&case.helper, input, &case.dims),
        DType::Float64 => broadcast_typed::<f64>(&case.helper, input, &case.dims),
    }
    .map_err(|error| format!("case '{}': {error}", case.name))?;
    let (output_ok, error_ok) = check_outcome(
        &case.name,
        &actual,
        case.expected.as_ref(),
        case.expected_error.as_deref(),
    )?;

    let passed = output_ok && error_ok;
    let mut extra_fields = outcome_fields(&actual);
    extra_fields.insert("helper".to_string(), json!(case.helper));
    extra_fields.insert("dims".to_string(), json!(case.dims));
    Ok(BroadcastCaseReport {
        name: case.name.clone(),
        output_ok,
        error_ok,
        forensic_log: case_log("broadcast", "broadcast_cases.json", &case.name, passed)
            .with_extra_fields(extra_fields),
    })
}

/// Outer error: the fixture itself is malformed. Inner error: the helper
/// rejected the input.
fn broadcast_typed<T: tsr_core::Element>(
    helper: &str,
    input: ArrayValue,
    dims: &[usize],
) -> Result<Result<ArrayValue, ErrorKind>, String> {
    let outcome = match (helper, dims) {
        ("as_scalar", []) => {
            as_scalar::<T>(&input, "input").map(|value| ArrayValue::from(TypedArray::scalar(value)))
        }
        ("as_vector", [size]) => as_vector::<T>(input, *size, "input").map(ArrayValue::from),
        ("as_matrix", [rows, cols]) => {
            as_matrix::<T>(input, *rows, *cols, "input").map(ArrayValue::from)
        }
        ("as_tensor", [pages, rows, cols]) => {
            as_tensor::<T>(input, *pages, *rows, *cols, "input").map(ArrayValue::from)
        }
        _ => {
            return Err(format!(
                "helper '{helper}' cannot take {} dimensions",
                dims.len()
            ));
        }
    };
    Ok(outcome.map_err(|error| error.kind()))
}

fn run_binary_case(case: &BinaryCase) -> Result<BinaryCaseReport, String> {
    let op = BinaryOp::parse(&case.op)
        .ok_or_else(|| format!("case '{}': unsupported operation '{}'", case.name, case.op))?;
    let lhs = case.lhs.to_array(&case.name)?;
    let rhs = case.rhs.to_array(&case.name)?;

    let session = Session::local();
    let mut builder = PrimitiveGraph::builder();
    builder
        .add(Binary::new(op), vec![Value::from(lhs.clone()), Value::from(rhs.clone())])
        .map_err(|error| error.to_string())?;
    let graph = builder.build().map_err(|error| error.to_string())?;
    let evaluated = block_on_local(session.eval(Arc::new(graph), Vec::new()))?
        .map_err(|error| error.kind)
        .and_then(|value| value.into_array().map_err(|error| error.kind()));

    let direct = dispatch_binary(op, lhs, rhs);
    let kernel = direct
        .as_ref()
        .ok()
        .map(|outcome| outcome.decision.kernel_name());
    let kernel_ok = match &case.expected_kernel {
        Some(expected) => kernel.as_deref() == Some(expected.as_str()),
        None => true,
    };
    let agree = match (&direct, &evaluated) {
        (Ok(outcome), Ok(value)) => arrays_match(&outcome.value, value),
        (Err(error), Err(kind)) => error.kind() == *kind,
        _ => false,
    };
    let (output_ok, error_ok) = check_outcome(
        &case.name,
        &evaluated,
        case.expected.as_ref(),
        case.expected_error.as_deref(),
    )?;

    let passed = output_ok && error_ok && kernel_ok && agree;
    let mut extra_fields = outcome_fields(&evaluated);
    extra_fields.insert("op".to_string(), json!(op.name()));
    extra_fields.insert("kernel".to_string(), json!(kernel));
    extra_fields.insert("graph_matches_direct_dispatch".to_string(), json!(agree));
    extra_fields.insert(
        "runtime_evidence".to_string(),
        json!(
            session
                .evidence()
                .iter()
                .map(|entry| entry.summary.clone())
                .collect::<Vec<_>>()
        ),
    );
    Ok(BinaryCaseReport {
        name: case.name.clone(),
        output_ok: output_ok && agree,
        kernel_ok,
        error_ok,
        forensic_log: case_log("binary_dispatch", "binary_cases.json", &case.name, passed)
            .with_extra_fields(extra_fields),
    })
}

fn run_tiling_case(case: &TilingCase) -> Result<TilingCaseReport, String> {
    let scheme = TilingScheme::parse(&case.scheme)
        .map_err(|error| format!("case '{}': {error}", case.name))?;
    let tiles: Result<Vec<TileInfo>, ErrorKind> = (0..case.numtiles.max(1))
        .map(|index| tile_spans_for(index, case.numtiles, &case.shape, scheme))
        .collect::<Result<_, _>>()
        .map_err(|error| error.kind());

    let (spans_ok, partition_ok, error_ok) = match (&tiles, &case.expected_error) {
        (Err(kind), Some(expected)) => (true, true, kind.name() == expected),
        (Err(_), None) | (Ok(_), Some(_)) => (false, true, false),
        (Ok(tiles), None) => {
            let actual: Vec<Vec<[usize; 2]>> = tiles
                .iter()
                .map(|tile| tile.spans.iter().map(|span| [span.start, span.stop]).collect())
                .collect();
            let partition_ok = check_partition(tiles, &case.shape).is_ok();
            (actual == case.expected_spans, partition_ok, true)
        }
    };

    let passed = spans_ok && partition_ok && error_ok;
    let mut extra_fields = BTreeMap::from([
        ("scheme".to_string(), json!(case.scheme)),
        ("shape".to_string(), json!(case.shape)),
        ("numtiles".to_string(), json!(case.numtiles)),
    ]);
    match &tiles {
        Ok(tiles) => extra_fields.insert(
            "spans".to_string(),
            json!(tiles.iter().map(ToString::to_string).collect::<Vec<_>>()),
        ),
        Err(kind) => extra_fields.insert("error_kind".to_string(), json!(kind.name())),
    };
    Ok(TilingCaseReport {
        name: case.name.clone(),
        spans_ok,
        partition_ok,
        error_ok,
        forensic_log: case_log("tiling", "tiling_cases.json", &case.name, passed)
            .with_extra_fields(extra_fields),
    })
}

fn run_codec_case(case: &CodecCase) -> Result<CodecCaseReport, String> {
    let array = case.array.to_array(&case.name)?;
    let encoded = encode_value(&Value::from(array.clone()))
        .map_err(|error| format!("case '{}': encode failed: {error}", case.name))?;
    let decoded = decode_value(&encoded)
        .map_err(|error| format!("case '{}': decode failed: {error}", case.name))?;
    let decode_ok = match &decoded {
        Value::Array(restored) => arrays_match(&array, restored) && !restored.is_reference(),
        _ => false,
    };
    let deterministic_ok = encode_value(&decoded).is_ok_and(|again| again == encoded);

    let passed = decode_ok && deterministic_ok;
    let extra_fields = BTreeMap::from([
        ("dtype".to_string(), json!(array.dtype().name())),
        ("shape".to_string(), json!(array.shape())),
        ("encoded_bytes".to_string(), json!(encoded.len())),
    ]);
    Ok(CodecCaseReport {
        name: case.name.clone(),
        decode_ok,
        deterministic_ok,
        forensic_log: case_log("codec", "codec_cases.json", &case.name, passed)
            .with_extra_fields(extra_fields),
    })
}

async fn run_gather_case(case: &GatherCase) -> Result<GatherCaseReport, String> {
    let tiles = case
        .tiles
        .iter()
        .map(|tile| tile.to_array(&case.name))
        .collect::<Result<Vec<_>, _>>()?;
    let world = InProcessWorld::new(tiles.len()).map_err(|error| error.to_string())?;
    let results = world
        .eval_each(|locality| {
            let mut builder = PrimitiveGraph::builder();
            builder.add(
                AllGather,
                vec![
                    Value::from(tiles[locality].clone()),
                    Value::from(case.scheme.as_str()),
                ],
            )?;
            builder.build()
        })
        .await;

    let mut output_ok = true;
    let mut error_ok = true;
    let mut per_locality = Vec::with_capacity(results.len());
    for result in results {
        let outcome = result
            .map_err(|error| error.kind)
            .and_then(|value| value.into_array().map_err(|error| error.kind()));
        let (locality_output_ok, locality_error_ok) = check_outcome(
            &case.name,
            &outcome,
            case.expected.as_ref(),
            case.expected_error.as_deref(),
        )?;
        output_ok &= locality_output_ok;
        error_ok &= locality_error_ok;
        per_locality.push(JsonValue::Object(outcome_fields(&outcome).into_iter().collect()));
    }

    let passed = output_ok && error_ok;
    let extra_fields = BTreeMap::from([
        ("scheme".to_string(), json!(case.scheme)),
        ("localities".to_string(), JsonValue::Array(per_locality)),
    ]);
    Ok(GatherCaseReport {
        name: case.name.clone(),
        localities: tiles.len(),
        output_ok,
        error_ok,
        forensic_log: case_log("all_gather", "gather_cases.json", &case.name, passed)
            .with_extra_fields(extra_fields),
    })
}

impl FixtureArray {
    fn to_array(&self, case: &str) -> Result<ArrayValue, String> {
        let dtype = DType::parse(&self.dtype)
            .ok_or_else(|| format!("case '{case}': unknown dtype '{}'", self.dtype))?;
        match dtype {
            DType::Bool => self.typed(case, JsonValue::as_bool).map(ArrayValue::from),
            DType::Int64 => self.typed(case, JsonValue::as_i64).map(ArrayValue::from),
            DType::Float64 => self.typed(case, JsonValue::as_f64).map(ArrayValue::from),
        }
    }

    fn typed<T: tsr_core::Element>(
        &self,
        case: &str,
        read: impl Fn(&JsonValue) -> Option<T>,
    ) -> Result<TypedArray<T>, String> {
        let values = self
            .data
            .iter()
            .enumerate()
            .map(|(index, value)| {
                read(value).ok_or_else(|| {
                    format!(
                        "case '{case}': element {index} ({value}) is not {}",
                        T::DTYPE
                    )
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        TypedArray::from_shape_vec(&self.shape, values)
            .map_err(|error| format!("case '{case}': {error}"))
    }
}

/// `(output_ok, error_ok)` of one observed outcome against the fixture's
/// expectation.
fn check_outcome(
    case: &str,
    actual: &Result<ArrayValue, ErrorKind>,
    expected: Option<&FixtureArray>,
    expected_error: Option<&str>,
) -> Result<(bool, bool), String> {
    match (expected_error, actual) {
        (Some(expected_kind), Err(kind)) => Ok((true, kind.name() == expected_kind)),
        (Some(_), Ok(_)) => Ok((false, false)),
        (None, actual) => {
            let expected = expected
                .ok_or_else(|| format!("case '{case}' has neither expected nor expected_error"))?
                .to_array(case)?;
            match actual {
                Ok(value) => Ok((arrays_match(&expected, value), true)),
                Err(_) => Ok((false, false)),
            }
        }
    }
}

fn arrays_match(expected: &ArrayValue, actual: &ArrayValue) -> bool {
    expected.dtype() == actual.dtype() && expected.values_equal(actual)
}

fn outcome_fields(outcome: &Result<ArrayValue, ErrorKind>) -> BTreeMap<String, JsonValue> {
    match outcome {
        Ok(array) => BTreeMap::from([
            ("actual_dtype".to_string(), json!(array.dtype().name())),
            ("actual_shape".to_string(), json!(array.shape())),
            ("actual_values".to_string(), json!(array.to_f64_vec())),
        ]),
        Err(kind) => BTreeMap::from([("error_kind".to_string(), json!(kind.name()))]),
    }
}

fn case_log(suite: &str, fixture: &str, case: &str, passed: bool) -> StructuredCaseLog {
    let (outcome, reason_code) = if passed {
        ("pass", "parity_ok")
    } else {
        ("fail", "expectation_mismatch")
    };
    StructuredCaseLog::new(
        suite,
        fixture,
        case,
        replay_command(suite, case),
        outcome,
        reason_code,
    )
}

fn block_on_local<F: std::future::Future>(future: F) -> Result<F::Output, String> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|error| format!("failed starting async runtime: {error}"))?;
    Ok(runtime.block_on(future))
}

fn suite_report<I>(suite: &'static str, passes: I) -> HarnessReport
where
    I: Iterator<Item = bool>,
{
    let (cases_total, cases_passed) = summarize_passes(passes);
    HarnessReport {
        suite,
        fixture_count: 1,
        cases_total,
        cases_passed,
    }
}

fn tally(report: &HarnessReport) -> (usize, usize) {
    (report.cases_total, report.cases_passed)
}

fn load_fixture<T>(path: &Path) -> Result<T, String>
where
    T: for<'de> Deserialize<'de>,
{
    let metadata = fs::metadata(path).map_err(|error| {
        format!(
            "failed reading fixture metadata {}: {error}",
            path.display()
        )
    })?;
    let size = metadata.len();
    if size > MAX_FIXTURE_BYTES {
        return Err(format!(
            "fixture {} exceeds max bytes: actual={size} max={MAX_FIXTURE_BYTES}",
            path.display()
        ));
    }

    let raw = fs::read_to_string(path)
        .map_err(|error| format!("failed reading fixture {}: {error}", path.display()))?;
    serde_json::from_str::<T>(&raw)
        .map_err(|error| format!("failed parsing fixture {}: {error}", path.display()))
}

fn summarize_passes<I>(iter: I) -> (usize, usize)
where
    I: Iterator<Item = bool>,
{
    let mut total = 0usize;
    let mut passed = 0usize;
    for is_passed in iter {
        total += 1;
        if is_passed {
            passed += 1;
        }
    }
    (total, passed)
}

//! Scenarios drive the driver under test against a running replay server
//! and assert on what it returns.

use std::{fmt, path::PathBuf};

use crate::{
    checks::{self, Envelope, GoldenOutcome, GoldenPolicy},
    config::FixtureMode,
    driver::{DatasetKind, Driver, FieldValue, OpenOptions, ProjWindow, RasterSummary, SubDataset},
    server::ReplayHandle,
};

/// Format selector some drivers append to sub-dataset URLs.
const FORMAT_QUERY: &str = "?f=json";

#[derive(Debug, Clone)]
pub struct ScenarioContext {
    /// `http://127.0.0.1:<port>` of the replay server.
    pub base_url: String,
    pub synthetic_prefix: String,
    pub golden_dir: PathBuf,
    pub golden_policy: GoldenPolicy,
}

impl ScenarioContext {
    /// Golden images are compared when replaying and (re)written when
    /// recording, mirroring how fixtures themselves are treated.
    pub fn for_server(handle: &ReplayHandle) -> Self {
        let golden_policy = match handle.mode() {
            FixtureMode::Replay => GoldenPolicy::Compare,
            FixtureMode::Record {
                refresh_existing: false,
            } => GoldenPolicy::WriteMissing,
            FixtureMode::Record {
                refresh_existing: true,
            } => GoldenPolicy::Refresh,
        };
        Self {
            base_url: handle.base_url().to_owned(),
            synthetic_prefix: handle.synthetic_prefix().to_owned(),
            golden_dir: handle.fixture_store().dir().to_path_buf(),
            golden_policy,
        }
    }

    /// Driver name for a server path, e.g. `OGCAPI:http://127.0.0.1:8080/fakeogcapi`.
    pub fn driver_name(&self, path: &str) -> String {
        format!("OGCAPI:{}{path}", self.base_url)
    }

    pub fn root_name(&self) -> String {
        self.driver_name(&self.synthetic_prefix)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionMatch {
    /// Sub-dataset description equals the label.
    Exact(String),
    /// Sub-dataset description contains the label.
    Contains(String),
}

impl CollectionMatch {
    fn matches(&self, description: &str) -> bool {
        match self {
            Self::Exact(label) => description == label,
            Self::Contains(label) => description.contains(label.as_str()),
        }
    }

    fn label(&self) -> &str {
        match self {
            Self::Exact(label) | Self::Contains(label) => label,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GeometryCheck {
    Wkt { wkt: String, tolerance: f64 },
    Envelope { envelope: Envelope, tolerance: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FirstFeature {
    pub kind: DatasetKind,
    pub options: OpenOptions,
    pub collection: CollectionMatch,
    /// Drop `?f=json` from the sub-dataset name before reopening it.
    pub strip_format_query: bool,
    pub layer: String,
    pub field_names: Vec<(usize, String)>,
    pub field_values: Vec<(String, FieldValue)>,
    pub geometry: GeometryCheck,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowedRaster {
    pub options: OpenOptions,
    pub collection: CollectionMatch,
    pub window: ProjWindow,
    pub width: usize,
    pub height: usize,
    /// File name of the golden image inside the golden directory.
    pub golden: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenFails {
    /// Server path, appended to the base URL.
    pub path: String,
    pub kind: DatasetKind,
    pub options: OpenOptions,
    pub expected_message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RasterLayout {
    pub path: String,
    pub options: OpenOptions,
    pub expected: RasterSummary,
    /// Relative tolerance for geotransform terms.
    pub geo_transform_tolerance: f64,
    pub read_center_block: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Check {
    FirstFeature(FirstFeature),
    WindowedRaster(WindowedRaster),
    OpenFails(OpenFails),
    RasterLayout(RasterLayout),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scenario {
    pub name: String,
    pub check: Check,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioFailure {
    pub message: String,
}

impl ScenarioFailure {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ScenarioFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ScenarioFailure {}

fn driver_failure(step: &str) -> impl FnOnce(anyhow::Error) -> ScenarioFailure + '_ {
    move |err| ScenarioFailure::new(format!("{step}: {err:#}"))
}

impl Scenario {
    pub fn new(name: impl Into<String>, check: Check) -> Self {
        Self {
            name: name.into(),
            check,
        }
    }

    pub fn run(&self, driver: &dyn Driver, ctx: &ScenarioContext) -> Result<(), ScenarioFailure> {
        match &self.check {
            Check::FirstFeature(check) => run_first_feature(check, driver, ctx),
            Check::WindowedRaster(check) => run_windowed_raster(check, driver, ctx).map(|_| ()),
            Check::OpenFails(check) => run_open_fails(check, driver, ctx),
            Check::RasterLayout(check) => run_raster_layout(check, driver, ctx),
        }
    }
}

fn select_sub_dataset(
    sub_datasets: Vec<SubDataset>,
    collection: &CollectionMatch,
) -> Result<SubDataset, ScenarioFailure> {
    let descriptions: Vec<String> = sub_datasets
        .iter()
        .map(|sub_dataset| sub_dataset.description.clone())
        .collect();
    sub_datasets
        .into_iter()
        .find(|sub_dataset| collection.matches(&sub_dataset.description))
        .ok_or_else(|| {
            ScenarioFailure::new(format!(
                "no sub-dataset matching `{}` among {descriptions:?}",
                collection.label()
            ))
        })
}

/// Opens the root endpoint, picks the matching collection and returns its
/// dataset name.
fn resolve_collection(
    driver: &dyn Driver,
    ctx: &ScenarioContext,
    kind: DatasetKind,
    options: &OpenOptions,
    collection: &CollectionMatch,
) -> Result<String, ScenarioFailure> {
    let root = driver
        .open(&ctx.root_name(), kind, options)
        .map_err(driver_failure("open root dataset"))?;
    let sub_datasets = root
        .sub_datasets()
        .map_err(driver_failure("list sub-datasets"))?;
    Ok(select_sub_dataset(sub_datasets, collection)?.name)
}

fn run_first_feature(
    check: &FirstFeature,
    driver: &dyn Driver,
    ctx: &ScenarioContext,
) -> Result<(), ScenarioFailure> {
    let mut name = resolve_collection(driver, ctx, check.kind, &check.options, &check.collection)?;
    if check.strip_format_query {
        name = name.replace(FORMAT_QUERY, "");
    }

    let mut dataset = driver
        .open(&name, check.kind, &check.options)
        .map_err(driver_failure("open collection"))?;
    let feature = dataset
        .first_feature(&check.layer)
        .map_err(driver_failure("read first feature"))?
        .ok_or_else(|| ScenarioFailure::new(format!("layer `{}` has no features", check.layer)))?;
    let mismatch = |message: String| {
        ScenarioFailure::new(format!("{message}\nfeature:\n{}", feature.describe()))
    };

    for (index, expected) in &check.field_names {
        let actual = feature.field_name(*index);
        if actual != Some(expected.as_str()) {
            return Err(mismatch(format!(
                "field {index} is named {actual:?}, expected {expected:?}"
            )));
        }
    }
    for (field, expected) in &check.field_values {
        let actual = feature.field(field);
        if actual != Some(expected) {
            return Err(mismatch(format!(
                "field `{field}` is {}, expected {expected}",
                actual.map_or_else(|| "missing".to_owned(), ToString::to_string)
            )));
        }
    }

    let wkt = feature
        .geometry_wkt
        .as_deref()
        .ok_or_else(|| mismatch("feature has no geometry".to_owned()))?;
    match &check.geometry {
        GeometryCheck::Wkt {
            wkt: expected,
            tolerance,
        } => checks::check_geometry(wkt, expected, *tolerance).map_err(mismatch),
        GeometryCheck::Envelope {
            envelope,
            tolerance,
        } => {
            let actual = checks::envelope_of(wkt).map_err(mismatch)?;
            if actual.approx_eq(envelope, *tolerance) {
                Ok(())
            } else {
                Err(mismatch(format!(
                    "envelope {actual:?} is not within {tolerance} of {envelope:?}"
                )))
            }
        }
    }
}

fn run_windowed_raster(
    check: &WindowedRaster,
    driver: &dyn Driver,
    ctx: &ScenarioContext,
) -> Result<GoldenOutcome, ScenarioFailure> {
    let name = resolve_collection(
        driver,
        ctx,
        DatasetKind::Raster,
        &check.options,
        &check.collection,
    )?;
    let dataset = driver
        .open(&name, DatasetKind::Raster, &check.options)
        .map_err(driver_failure("open collection"))?;
    let png = dataset
        .translate_png(&check.window, check.width, check.height)
        .map_err(driver_failure("translate window"))?;

    let golden_path = ctx.golden_dir.join(&check.golden);
    let outcome =
        checks::check_golden(&png, &golden_path, ctx.golden_policy).map_err(ScenarioFailure::new)?;
    if outcome == GoldenOutcome::Written {
        tracing::info!(golden = %golden_path.display(), "wrote golden image");
    }
    Ok(outcome)
}

fn run_open_fails(
    check: &OpenFails,
    driver: &dyn Driver,
    ctx: &ScenarioContext,
) -> Result<(), ScenarioFailure> {
    let name = ctx.driver_name(&check.path);
    match driver.open(&name, check.kind, &check.options) {
        Ok(_) => Err(ScenarioFailure::new(format!(
            "opening `{name}` as {} succeeded, expected `{}`",
            check.kind, check.expected_message
        ))),
        Err(err) => {
            let message = format!("{err:#}");
            if message.contains(&check.expected_message) {
                Ok(())
            } else {
                Err(ScenarioFailure::new(format!(
                    "opening `{name}` failed with `{message}`, expected `{}`",
                    check.expected_message
                )))
            }
        }
    }
}

fn run_raster_layout(
    check: &RasterLayout,
    driver: &dyn Driver,
    ctx: &ScenarioContext,
) -> Result<(), ScenarioFailure> {
    let name = ctx.driver_name(&check.path);
    let dataset = driver
        .open(&name, DatasetKind::Raster, &check.options)
        .map_err(driver_failure("open raster"))?;
    let actual = dataset
        .raster_summary()
        .map_err(driver_failure("read raster summary"))?;
    let expected = &check.expected;

    let counts = [
        ("band count", actual.band_count, expected.band_count),
        ("width", actual.width, expected.width),
        ("height", actual.height, expected.height),
        ("overview count", actual.overview_count, expected.overview_count),
    ];
    for (what, actual, expected) in counts {
        if actual != expected {
            return Err(ScenarioFailure::new(format!(
                "{what} is {actual}, expected {expected}"
            )));
        }
    }

    for (index, (a, e)) in actual
        .geo_transform
        .iter()
        .zip(expected.geo_transform.iter())
        .enumerate()
    {
        let allowed = check.geo_transform_tolerance * e.abs().max(1.0);
        if (a - e).abs() > allowed {
            return Err(ScenarioFailure::new(format!(
                "geotransform[{index}] is {a}, expected {e}"
            )));
        }
    }

    if let Some(expected_checksum) = expected.smallest_overview_checksum
        && actual.smallest_overview_checksum != Some(expected_checksum)
    {
        return Err(ScenarioFailure::new(format!(
            "smallest overview checksum is {:?}, expected {expected_checksum}",
            actual.smallest_overview_checksum
        )));
    }

    if check.read_center_block {
        dataset
            .read_center_block()
            .map_err(driver_failure("read centre block"))?;
    }
    Ok(())
}

#[derive(Debug)]
pub struct ScenarioOutcome {
    pub name: String,
    pub result: Result<(), ScenarioFailure>,
}

#[derive(Debug, Default)]
pub struct ScenarioReport {
    pub outcomes: Vec<ScenarioOutcome>,
}

impl ScenarioReport {
    pub fn passed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.result.is_ok())
            .count()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &ScenarioFailure)> {
        self.outcomes.iter().filter_map(|outcome| {
            outcome
                .result
                .as_ref()
                .err()
                .map(|failure| (outcome.name.as_str(), failure))
        })
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn summary(&self) -> String {
        let mut out = format!(
            "{} scenario(s): {} passed, {} failed\n",
            self.outcomes.len(),
            self.passed(),
            self.outcomes.len() - self.passed()
        );
        for (name, failure) in self.failures() {
            out.push_str(&format!("FAILED {name}: {failure}\n"));
        }
        out
    }
}

/// Runs every scenario, continuing past failures. Driver calls block, so
/// call this off the runtime that hosts the replay server.
pub fn run_scenarios(
    driver: &dyn Driver,
    scenarios: &[Scenario],
    ctx: &ScenarioContext,
) -> ScenarioReport {
    let outcomes = scenarios
        .iter()
        .map(|scenario| {
            let result = scenario.run(driver, ctx);
            match &result {
                Ok(()) => tracing::debug!(scenario = %scenario.name, "scenario passed"),
                Err(failure) => {
                    tracing::warn!(scenario = %scenario.name, "scenario failed: {failure}")
                }
            }
            ScenarioOutcome {
                name: scenario.name.clone(),
                result,
            }
        })
        .collect();
    ScenarioReport { outcomes }
}

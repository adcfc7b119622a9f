//! The seam between scenarios and the driver under test.
//!
//! Everything OGC API specific (paging, tile matrices, format negotiation,
//! compositing) happens behind [`Driver`]; scenarios only see datasets,
//! features and encoded images.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Api {
    Items,
    Tiles,
    Map,
    Coverage,
}

impl Api {
    pub fn as_option_value(self) -> &'static str {
        match self {
            Self::Items => "ITEMS",
            Self::Tiles => "TILES",
            Self::Map => "MAP",
            Self::Coverage => "COVERAGE",
        }
    }
}

impl fmt::Display for Api {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_option_value())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorFormat {
    Auto,
    GeoJson,
    GeoJsonPreferred,
    Mvt,
    MvtPreferred,
}

impl VectorFormat {
    pub const ALL: [Self; 5] = [
        Self::Auto,
        Self::GeoJson,
        Self::GeoJsonPreferred,
        Self::Mvt,
        Self::MvtPreferred,
    ];

    pub fn as_option_value(self) -> &'static str {
        match self {
            Self::Auto => "AUTO",
            Self::GeoJson => "GEOJSON",
            Self::GeoJsonPreferred => "GEOJSON_PREFERRED",
            Self::Mvt => "MVT",
            Self::MvtPreferred => "MVT_PREFERRED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetKind {
    Vector,
    Raster,
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vector => f.write_str("vector"),
            Self::Raster => f.write_str("raster"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenOptions {
    pub cache: bool,
    pub api: Api,
    pub vector_format: Option<VectorFormat>,
    pub tile_matrix_set: Option<String>,
}

impl OpenOptions {
    /// Caching is off by default so every open goes through the server.
    pub fn new(api: Api) -> Self {
        Self {
            cache: false,
            api,
            vector_format: None,
            tile_matrix_set: None,
        }
    }

    pub fn with_vector_format(mut self, vector_format: VectorFormat) -> Self {
        self.vector_format = Some(vector_format);
        self
    }

    pub fn with_tile_matrix_set(mut self, tile_matrix_set: impl Into<String>) -> Self {
        self.tile_matrix_set = Some(tile_matrix_set.into());
        self
    }

    /// `KEY=VALUE` open options in the order the driver documents them.
    pub fn to_strings(&self) -> Vec<String> {
        let mut options = vec![
            format!("CACHE={}", if self.cache { "YES" } else { "NO" }),
            format!("API={}", self.api.as_option_value()),
        ];
        if let Some(vector_format) = self.vector_format {
            options.push(format!("VECTOR_FORMAT={}", vector_format.as_option_value()));
        }
        if let Some(tile_matrix_set) = &self.tile_matrix_set {
            options.push(format!("TILEMATRIXSET={tile_matrix_set}"));
        }
        options
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubDataset {
    /// Openable dataset name (usually a driver-prefixed URL).
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Integer(i64),
    Real(f64),
    String(String),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("(null)"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Real(value) => write!(f, "{value}"),
            Self::String(value) => write!(f, "{value:?}"),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Feature {
    /// Fields in layer definition order.
    pub fields: Vec<(String, FieldValue)>,
    pub geometry_wkt: Option<String>,
}

impl Feature {
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(field_name, _)| field_name == name)
            .map(|(_, value)| value)
    }

    pub fn field_name(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(|(name, _)| name.as_str())
    }

    /// Multi-line dump used in failure messages.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.fields {
            out.push_str(&format!("  {name} = {value}\n"));
        }
        match &self.geometry_wkt {
            Some(wkt) => out.push_str(&format!("  geometry = {wkt}\n")),
            None => out.push_str("  geometry = (none)\n"),
        }
        out
    }
}

/// A `-projwin` style window: upper-left and lower-right corners in the
/// dataset's georeferenced coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjWindow {
    pub ulx: f64,
    pub uly: f64,
    pub lrx: f64,
    pub lry: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RasterSummary {
    pub band_count: usize,
    pub width: usize,
    pub height: usize,
    pub geo_transform: [f64; 6],
    pub overview_count: usize,
    /// Checksum of band 1's smallest overview, when the driver can compute one.
    pub smallest_overview_checksum: Option<i64>,
}

pub trait Driver {
    fn open(
        &self,
        name: &str,
        kind: DatasetKind,
        options: &OpenOptions,
    ) -> anyhow::Result<Box<dyn Dataset>>;
}

pub trait Dataset {
    fn sub_datasets(&self) -> anyhow::Result<Vec<SubDataset>>;

    /// First feature of `layer`; an unknown layer is an error, an empty one is
    /// `Ok(None)`.
    fn first_feature(&mut self, layer: &str) -> anyhow::Result<Option<Feature>>;

    /// Resamples `window` to `width` x `height` and encodes it as PNG.
    fn translate_png(&self, window: &ProjWindow, width: usize, height: usize)
    -> anyhow::Result<Vec<u8>>;

    fn raster_summary(&self) -> anyhow::Result<RasterSummary>;

    /// Reads the block at the centre of band 1.
    fn read_center_block(&self) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::{Api, Feature, FieldValue, OpenOptions, VectorFormat};

    #[test]
    fn open_options_render_in_driver_order() {
        let options = OpenOptions::new(Api::Tiles)
            .with_vector_format(VectorFormat::MvtPreferred)
            .with_tile_matrix_set("WorldMercatorWGS84Quad");
        assert_eq!(
            options.to_strings(),
            vec![
                "CACHE=NO",
                "API=TILES",
                "VECTOR_FORMAT=MVT_PREFERRED",
                "TILEMATRIXSET=WorldMercatorWGS84Quad",
            ]
        );
        assert_eq!(
            OpenOptions::new(Api::Items).to_strings(),
            vec!["CACHE=NO", "API=ITEMS"]
        );
    }

    #[test]
    fn feature_lookup_by_name_and_index() {
        let feature = Feature {
            fields: vec![
                ("feature::id".to_owned(), FieldValue::Integer(1)),
                ("name".to_owned(), "Loch Bhanabhaidh".into()),
            ],
            geometry_wkt: None,
        };
        assert_eq!(feature.field_name(0), Some("feature::id"));
        assert_eq!(feature.field_name(2), None);
        assert_eq!(feature.field("name"), Some(&FieldValue::from("Loch Bhanabhaidh")));
        assert!(feature.describe().contains("name = \"Loch Bhanabhaidh\""));
        assert!(feature.describe().contains("geometry = (none)"));
    }
}

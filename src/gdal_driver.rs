//! [`Driver`] backed by GDAL's OGCAPI driver.

use std::{
    ffi::{CString, c_char, c_int},
    fs,
    path::Path,
    ptr,
};

use anyhow::{Context, anyhow, bail};
use gdal::{
    DatasetOptions, GdalOpenFlags, Metadata as _,
    vector::{FieldValue as GdalFieldValue, LayerAccess as _},
};

use crate::driver::{
    Dataset, DatasetKind, Driver, Feature, FieldValue, OpenOptions, ProjWindow, RasterSummary,
    SubDataset,
};

const SUBDATASETS_DOMAIN: &str = "SUBDATASETS";
const CENTER_BLOCK_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, Default)]
pub struct GdalDriver;

impl Driver for GdalDriver {
    fn open(
        &self,
        name: &str,
        kind: DatasetKind,
        options: &OpenOptions,
    ) -> anyhow::Result<Box<dyn Dataset>> {
        let open_options = options.to_strings();
        let open_option_refs: Vec<&str> = open_options.iter().map(String::as_str).collect();
        let open_flags = match kind {
            DatasetKind::Vector => GdalOpenFlags::GDAL_OF_VECTOR,
            DatasetKind::Raster => GdalOpenFlags::GDAL_OF_RASTER,
        } | GdalOpenFlags::GDAL_OF_READONLY
            | GdalOpenFlags::GDAL_OF_VERBOSE_ERROR;

        tracing::debug!(name, %kind, options = ?open_options, "opening dataset");
        let dataset = gdal::Dataset::open_ex(
            name,
            DatasetOptions {
                open_flags,
                open_options: Some(open_option_refs.as_slice()),
                ..DatasetOptions::default()
            },
        )
        .with_context(|| format!("open {name} as {kind}"))?;
        Ok(Box::new(GdalDataset { dataset }))
    }
}

struct GdalDataset {
    dataset: gdal::Dataset,
}

fn convert_field(value: Option<GdalFieldValue>) -> FieldValue {
    match value {
        None => FieldValue::Null,
        Some(GdalFieldValue::IntegerValue(value)) => FieldValue::Integer(value.into()),
        Some(GdalFieldValue::Integer64Value(value)) => FieldValue::Integer(value),
        Some(GdalFieldValue::RealValue(value)) => FieldValue::Real(value),
        Some(GdalFieldValue::StringValue(value)) => FieldValue::String(value),
        Some(other) => other
            .into_string()
            .map_or(FieldValue::Null, FieldValue::String),
    }
}

/// Pairs `SUBDATASET_<n>_NAME` / `SUBDATASET_<n>_DESC` metadata items.
fn parse_sub_datasets(items: &[String]) -> Vec<SubDataset> {
    let mut names = Vec::new();
    let mut descriptions = Vec::new();
    for item in items {
        let Some((key, value)) = item.split_once('=') else {
            continue;
        };
        let Some(rest) = key.strip_prefix("SUBDATASET_") else {
            continue;
        };
        if let Some(index) = rest.strip_suffix("_NAME") {
            names.push((index.to_owned(), value.to_owned()));
        } else if let Some(index) = rest.strip_suffix("_DESC") {
            descriptions.push((index.to_owned(), value.to_owned()));
        }
    }

    names
        .into_iter()
        .map(|(index, name)| {
            let description = descriptions
                .iter()
                .find(|(desc_index, _)| *desc_index == index)
                .map(|(_, description)| description.clone())
                .unwrap_or_default();
            SubDataset { name, description }
        })
        .collect()
}

fn translate_args(window: &ProjWindow, width: usize, height: usize) -> Vec<String> {
    [
        "-of".to_owned(),
        "PNG".to_owned(),
        "-outsize".to_owned(),
        width.to_string(),
        height.to_string(),
        "-projwin".to_owned(),
        window.ulx.to_string(),
        window.uly.to_string(),
        window.lrx.to_string(),
        window.lry.to_string(),
    ]
    .into()
}

fn last_gdal_error() -> String {
    // SAFETY: CPLGetLastErrorMsg returns a thread-local, NUL-terminated string.
    unsafe {
        let message = gdal_sys::CPLGetLastErrorMsg();
        if message.is_null() {
            return String::new();
        }
        std::ffi::CStr::from_ptr(message)
            .to_string_lossy()
            .into_owned()
    }
}

fn translate_to_file(
    dataset: &gdal::Dataset,
    destination: &Path,
    args: &[String],
) -> anyhow::Result<()> {
    let args = args
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<Result<Vec<_>, _>>()
        .context("translate argument contains NUL")?;
    let mut argv: Vec<*mut c_char> = args.iter().map(|arg| arg.as_ptr().cast_mut()).collect();
    argv.push(ptr::null_mut());
    let destination = CString::new(destination.to_string_lossy().as_bytes())
        .context("output path contains NUL")?;

    // SAFETY: argv is NULL-terminated and outlives the options object; GDAL
    // copies the arguments. Every handle is released before returning.
    unsafe {
        let options = gdal_sys::GDALTranslateOptionsNew(argv.as_mut_ptr(), ptr::null_mut());
        if options.is_null() {
            bail!("invalid translate options: {}", last_gdal_error());
        }
        let mut usage_error: c_int = 0;
        let output = gdal_sys::GDALTranslate(
            destination.as_ptr(),
            dataset.c_dataset(),
            options,
            &mut usage_error,
        );
        gdal_sys::GDALTranslateOptionsFree(options);
        if output.is_null() {
            bail!("translate failed: {}", last_gdal_error());
        }
        gdal_sys::GDALClose(output);
    }
    Ok(())
}

impl Dataset for GdalDataset {
    fn sub_datasets(&self) -> anyhow::Result<Vec<SubDataset>> {
        Ok(self
            .dataset
            .metadata_domain(SUBDATASETS_DOMAIN)
            .map(|items| parse_sub_datasets(&items))
            .unwrap_or_default())
    }

    fn first_feature(&mut self, layer: &str) -> anyhow::Result<Option<Feature>> {
        let mut layer = self
            .dataset
            .layer_by_name(layer)
            .with_context(|| format!("layer {layer}"))?;
        let Some(feature) = layer.features().next() else {
            return Ok(None);
        };

        let fields = feature
            .fields()
            .map(|(name, value)| (name, convert_field(value)))
            .collect();
        let geometry_wkt = feature
            .geometry()
            .map(|geometry| geometry.wkt())
            .transpose()
            .context("export geometry as WKT")?;
        Ok(Some(Feature {
            fields,
            geometry_wkt,
        }))
    }

    fn translate_png(
        &self,
        window: &ProjWindow,
        width: usize,
        height: usize,
    ) -> anyhow::Result<Vec<u8>> {
        let scratch = tempfile::tempdir().context("create translate scratch directory")?;
        let destination = scratch.path().join("translated.png");
        translate_to_file(
            &self.dataset,
            &destination,
            &translate_args(window, width, height),
        )?;
        fs::read(&destination).with_context(|| format!("read {}", destination.display()))
    }

    fn raster_summary(&self) -> anyhow::Result<RasterSummary> {
        let (width, height) = self.dataset.raster_size();
        let geo_transform = self.dataset.geo_transform().context("geotransform")?;
        let band = self.dataset.rasterband(1).context("band 1")?;
        let overview_count = band.overview_count().context("overview count")?;

        let smallest_overview_checksum = if overview_count > 0 {
            let overview = band
                .overview((overview_count - 1).try_into()?)
                .context("smallest overview")?;
            let (x_size, y_size) = overview.size();
            // SAFETY: the overview handle is owned by the dataset, which is
            // borrowed for the duration of the call.
            let checksum = unsafe {
                gdal_sys::GDALChecksumImage(
                    overview.c_rasterband(),
                    0,
                    0,
                    c_int::try_from(x_size)?,
                    c_int::try_from(y_size)?,
                )
            };
            Some(i64::from(checksum))
        } else {
            None
        };

        Ok(RasterSummary {
            band_count: usize::try_from(self.dataset.raster_count())?,
            width,
            height,
            geo_transform,
            overview_count: usize::try_from(overview_count)?,
            smallest_overview_checksum,
        })
    }

    fn read_center_block(&self) -> anyhow::Result<()> {
        let (width, height) = self.dataset.raster_size();
        let band = self.dataset.rasterband(1).context("band 1")?;
        let (block_x, block_y) = (
            width / 2 / CENTER_BLOCK_SIZE * CENTER_BLOCK_SIZE,
            height / 2 / CENTER_BLOCK_SIZE * CENTER_BLOCK_SIZE,
        );
        let size = (
            CENTER_BLOCK_SIZE.min(width - block_x),
            CENTER_BLOCK_SIZE.min(height - block_y),
        );
        band.read_as::<u8>(
            (isize::try_from(block_x)?, isize::try_from(block_y)?),
            size,
            size,
            None,
        )
        .map(|_| ())
        .map_err(|err| anyhow!("read block at ({block_x}, {block_y}): {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_sub_datasets, translate_args};
    use crate::{driver::SubDataset, suite::LOUGH_CORRIB_WINDOW};

    #[test]
    fn sub_datasets_pair_names_with_descriptions() {
        let items = vec![
            "SUBDATASET_1_NAME=OGCAPI:http://127.0.0.1:8080/fakeogcapi/collections/lakes".to_owned(),
            "SUBDATASET_2_DESC=Collection SRTM".to_owned(),
            "SUBDATASET_1_DESC=Collection ne_10m_lakes_europe".to_owned(),
            "SUBDATASET_2_NAME=OGCAPI:http://127.0.0.1:8080/fakeogcapi/collections/srtm".to_owned(),
            "UNRELATED=1".to_owned(),
        ];
        assert_eq!(
            parse_sub_datasets(&items),
            vec![
                SubDataset {
                    name: "OGCAPI:http://127.0.0.1:8080/fakeogcapi/collections/lakes".to_owned(),
                    description: "Collection ne_10m_lakes_europe".to_owned(),
                },
                SubDataset {
                    name: "OGCAPI:http://127.0.0.1:8080/fakeogcapi/collections/srtm".to_owned(),
                    description: "Collection SRTM".to_owned(),
                },
            ]
        );
    }

    #[test]
    fn translate_args_match_gdal_translate_cli() {
        assert_eq!(
            translate_args(&LOUGH_CORRIB_WINDOW, 100, 100).join(" "),
            "-of PNG -outsize 100 100 -projwin -9.5377 53.5421 -9.0557 53.2953"
        );
    }
}

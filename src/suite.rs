//! The recorded OGC API regression suite.

use crate::{
    checks::Envelope,
    driver::{Api, DatasetKind, FieldValue, OpenOptions, ProjWindow, RasterSummary, VectorFormat},
    scenario::{
        Check, CollectionMatch, FirstFeature, GeometryCheck, OpenFails, RasterLayout, Scenario,
        WindowedRaster,
    },
};

pub const LAKES_COLLECTION: &str = "Collection ne_10m_lakes_europe";
pub const LAKES_LAYER: &str = "NaturalEarth:physical:ne_10m_lakes_europe";
pub const TILES_LAYER: &str = "Zoom level 2";
pub const COVERAGE_COLLECTION: &str = "SRTM";
pub const RASTER_TILES_PATH: &str = "/fakeogcapi/collections/HRDEM-RedRiver:DTM:2m";
pub const TILE_MATRIX_SET: &str = "WorldMercatorWGS84Quad";

/// `-projwin -9.5377 53.5421 -9.0557 53.2953` around Lough Corrib.
pub const LOUGH_CORRIB_WINDOW: ProjWindow = ProjWindow {
    ulx: -9.5377,
    uly: 53.5421,
    lrx: -9.0557,
    lry: 53.2953,
};

pub const LOUGH_CORRIB_ENVELOPE: Envelope = Envelope::new(-9.454, -9.190, 53.422, 53.519);

const LOCH_BHANABHAIDH_WKT: &str = "POLYGON ((-4.6543673319905 58.1553000824025,-4.6250972807178 58.1436693142282,-4.6081017670756 58.1342702801685,-4.5893036989562 58.1245279023988,-4.5722223493866 58.1163305713239,-4.5518792345724 58.1083907480315,-4.5339395257279 58.101137612159,-4.5218366599524 58.0922965116279,-4.4935108038821 58.0780048297015,-4.4530820820363 58.0534128364768,-4.4285330067753 58.0354731276323,-4.4254429133858 58.0470180598791,-4.4260437648782 58.0616530855155,-4.4324814594397 58.0646573429775,-4.4707642830983 58.0880047152536,-4.5038969511079 58.1081761582128,-4.5227808551547 58.1120816929134,-4.5409780717817 58.1248712461088,-4.5504200238052 58.126330456876,-4.563467084783 58.126330456876,-4.5802050906427 58.14002128731,-4.6111918604651 58.154055461454,-4.6317924830617 58.1573601446622,-4.6504188793261 58.1622527925289,-4.6814056491485 58.1725960217909,-4.7105898644937 58.182252563633,-4.7324780260026 58.1904928126717,-4.7421774858085 58.1910936641641,-4.7303321278154 58.179591649881,-4.6950535616188 58.1656003937008,-4.6762554934994 58.1598064685955,-4.6543673319905 58.1553000824025))";

const OPEN_FAILURE_CASES: [(Api, DatasetKind); 4] = [
    (Api::Map, DatasetKind::Raster),
    (Api::Tiles, DatasetKind::Raster),
    (Api::Coverage, DatasetKind::Raster),
    (Api::Tiles, DatasetKind::Vector),
];

pub fn features_scenario() -> Scenario {
    Scenario::new(
        "features/items",
        Check::FirstFeature(FirstFeature {
            kind: DatasetKind::Vector,
            options: OpenOptions::new(Api::Items),
            collection: CollectionMatch::Exact(LAKES_COLLECTION.to_owned()),
            strip_format_query: false,
            layer: LAKES_LAYER.to_owned(),
            field_names: vec![(0, "feature::id".to_owned()), (3, "name".to_owned())],
            field_values: vec![
                ("name".to_owned(), FieldValue::from("Loch Bhanabhaidh")),
                ("feature::id".to_owned(), FieldValue::Integer(1)),
                ("id".to_owned(), FieldValue::Integer(98696)),
            ],
            geometry: GeometryCheck::Wkt {
                wkt: LOCH_BHANABHAIDH_WKT.to_owned(),
                tolerance: 0.00001,
            },
        }),
    )
}

/// MVT and GeoJSON tiles differ in vertex order and precision, so only the
/// envelope is compared.
pub fn vector_tiles_scenario(vector_format: VectorFormat) -> Scenario {
    Scenario::new(
        format!("vector-tiles/{}", vector_format.as_option_value()),
        Check::FirstFeature(FirstFeature {
            kind: DatasetKind::Vector,
            options: OpenOptions::new(Api::Tiles).with_vector_format(vector_format),
            collection: CollectionMatch::Exact(LAKES_COLLECTION.to_owned()),
            strip_format_query: true,
            layer: TILES_LAYER.to_owned(),
            field_names: Vec::new(),
            field_values: vec![("name".to_owned(), FieldValue::from("Corrib ( Lough )"))],
            geometry: GeometryCheck::Envelope {
                envelope: LOUGH_CORRIB_ENVELOPE,
                tolerance: 0.01,
            },
        }),
    )
}

pub fn golden_image_name(api: Api) -> String {
    format!("expected_map_lough_corrib_{}.png", api.as_option_value())
}

pub fn windowed_raster_scenario(api: Api, collection: &str) -> Scenario {
    Scenario::new(
        format!("raster/{}", api.as_option_value()),
        Check::WindowedRaster(WindowedRaster {
            options: OpenOptions::new(api),
            collection: CollectionMatch::Contains(collection.to_owned()),
            window: LOUGH_CORRIB_WINDOW,
            width: 100,
            height: 100,
            golden: golden_image_name(api),
        }),
    )
}

pub fn wrong_collection_scenario(api: Api, kind: DatasetKind) -> Scenario {
    Scenario::new(
        format!("wrong-collection/{}/{kind}", api.as_option_value()),
        Check::OpenFails(OpenFails {
            path: "/fakeogcapi/collections/NOT_EXISTS".to_owned(),
            kind,
            options: OpenOptions::new(api),
            expected_message: "Invalid data collection".to_owned(),
        }),
    )
}

pub fn wrong_url_scenario(api: Api, kind: DatasetKind) -> Scenario {
    Scenario::new(
        format!("wrong-url/{}/{kind}", api.as_option_value()),
        Check::OpenFails(OpenFails {
            path: "/NOT_FOUND/".to_owned(),
            kind,
            options: OpenOptions::new(api),
            expected_message: "File Not Found".to_owned(),
        }),
    )
}

pub fn raster_tiles_layout_scenario() -> Scenario {
    Scenario::new(
        "raster-tiles/layout",
        Check::RasterLayout(RasterLayout {
            path: RASTER_TILES_PATH.to_owned(),
            options: OpenOptions::new(Api::Tiles).with_tile_matrix_set(TILE_MATRIX_SET),
            expected: RasterSummary {
                band_count: 4,
                width: 82734,
                height: 106149,
                geo_transform: [
                    -10902129.741315002,
                    2.388657133911758,
                    0.0,
                    6479743.648362301,
                    0.0,
                    -2.388657133911758,
                ],
                overview_count: 16,
                smallest_overview_checksum: Some(5),
            },
            geo_transform_tolerance: 1e-6,
            read_center_block: true,
        }),
    )
}

/// Every scenario of the suite, in a stable order.
pub fn builtin_scenarios() -> Vec<Scenario> {
    let mut scenarios = vec![features_scenario()];
    scenarios.extend(VectorFormat::ALL.into_iter().map(vector_tiles_scenario));
    scenarios.extend([
        windowed_raster_scenario(Api::Map, LAKES_COLLECTION),
        windowed_raster_scenario(Api::Tiles, LAKES_COLLECTION),
        windowed_raster_scenario(Api::Coverage, COVERAGE_COLLECTION),
    ]);
    scenarios.extend(
        OPEN_FAILURE_CASES
            .into_iter()
            .map(|(api, kind)| wrong_collection_scenario(api, kind)),
    );
    scenarios.extend(
        OPEN_FAILURE_CASES
            .into_iter()
            .map(|(api, kind)| wrong_url_scenario(api, kind)),
    );
    scenarios.push(raster_tiles_layout_scenario());
    scenarios
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::{builtin_scenarios, golden_image_name};
    use crate::{
        checks,
        driver::Api,
        scenario::{Check, GeometryCheck},
    };

    #[test]
    fn suite_covers_every_case_once() {
        let scenarios = builtin_scenarios();
        assert_eq!(scenarios.len(), 18);

        let names: HashSet<&str> = scenarios.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names.len(), scenarios.len(), "scenario names must be unique");
        for name in [
            "features/items",
            "vector-tiles/MVT_PREFERRED",
            "raster/COVERAGE",
            "wrong-collection/TILES/vector",
            "wrong-url/MAP/raster",
            "raster-tiles/layout",
        ] {
            assert!(names.contains(name), "missing scenario {name}");
        }
    }

    #[test]
    fn golden_images_are_keyed_by_api() {
        assert_eq!(golden_image_name(Api::Map), "expected_map_lough_corrib_MAP.png");
        assert_eq!(
            golden_image_name(Api::Coverage),
            "expected_map_lough_corrib_COVERAGE.png"
        );
    }

    #[test]
    fn expected_feature_geometry_is_valid_wkt() {
        let scenarios = builtin_scenarios();
        let Check::FirstFeature(features) = &scenarios[0].check else {
            panic!("first scenario should read a feature");
        };
        let GeometryCheck::Wkt { wkt, .. } = &features.geometry else {
            panic!("features scenario should compare WKT");
        };
        checks::check_geometry(wkt, wkt, 0.0).unwrap();
    }
}

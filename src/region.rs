use std::path::Path;

use anyhow::{anyhow, bail, Context};
use geo::{BoundingRect, Contains, Geometry, Intersects, MultiPolygon, Point, Polygon, Rect};
use geojson::{Feature, GeoJson};
use ndarray::parallel::prelude::*;
use ndarray::{Array2, Axis};
use tracing::warn;

use crate::raster::Grid;

/// A named polygonal area: the national boundary or one admin-1 unit.
#[derive(Debug, Clone)]
pub struct Region {
    pub name: String,
    pub shape: MultiPolygon<f64>,
}

impl Region {
    pub fn bounds(&self) -> Option<Rect<f64>> {
        self.shape.bounding_rect()
    }

    /// True for every pixel whose centre lies inside the region.
    pub fn mask(&self, grid: &Grid) -> Array2<bool> {
        let mut mask = Array2::from_elem(grid.shape(), false);
        let Some(bounds) = self.bounds() else {
            return mask;
        };
        if !bounds.intersects(&grid.bounds()) {
            return mask;
        }

        mask.axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(row, mut line)| {
                let (_, y) = grid.cell_center(row, 0);
                if y < bounds.min().y || y > bounds.max().y {
                    return;
                }
                for (col, inside) in line.iter_mut().enumerate() {
                    let (x, _) = grid.cell_center(row, col);
                    if x < bounds.min().x || x > bounds.max().x {
                        continue;
                    }
                    *inside = self.shape.contains(&Point::new(x, y));
                }
            });

        mask
    }
}

/// Loads every polygon in the file as one region.
pub fn load_national(path: &Path, name: &str) -> anyhow::Result<Region> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read boundary {}", path.display()))?;
    parse_national(&text, name).with_context(|| format!("invalid boundary {}", path.display()))
}

pub fn parse_national(text: &str, name: &str) -> anyhow::Result<Region> {
    let mut polygons = Vec::new();
    for feature in features(text.parse()?) {
        if let Some(geometry) = feature.geometry {
            polygons.extend(polygons_of(geometry.value.try_into()?));
        }
    }

    if polygons.is_empty() {
        bail!("no polygon geometry found");
    }

    Ok(Region {
        name: name.to_string(),
        shape: MultiPolygon::new(polygons),
    })
}

/// Loads one region per feature, named by `name_property`.
pub fn load_admin(path: &Path, name_property: &str) -> anyhow::Result<Vec<Region>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read boundaries {}", path.display()))?;
    parse_admin(&text, name_property)
        .with_context(|| format!("invalid boundaries {}", path.display()))
}

pub fn parse_admin(text: &str, name_property: &str) -> anyhow::Result<Vec<Region>> {
    let mut regions = Vec::new();

    for (index, feature) in features(text.parse()?).into_iter().enumerate() {
        let name = match feature.property(name_property) {
            Some(serde_json::Value::String(name)) => name.clone(),
            Some(serde_json::Value::Number(number)) => number.to_string(),
            _ => {
                return Err(anyhow!(
                    "feature {index} has no '{name_property}' property"
                ))
            }
        };

        let polygons = match feature.geometry {
            Some(geometry) => polygons_of(geometry.value.try_into()?),
            None => Vec::new(),
        };
        if polygons.is_empty() {
            warn!(region = %name, "skipping region without polygon geometry");
            continue;
        }

        regions.push(Region {
            name,
            shape: MultiPolygon::new(polygons),
        });
    }

    Ok(regions)
}

fn features(geojson: GeoJson) -> Vec<Feature> {
    match geojson {
        GeoJson::FeatureCollection(collection) => collection.features,
        GeoJson::Feature(feature) => vec![feature],
        GeoJson::Geometry(geometry) => vec![Feature {
            bbox: None,
            geometry: Some(geometry),
            id: None,
            properties: None,
            foreign_members: None,
        }],
    }
}

fn polygons_of(geometry: Geometry<f64>) -> Vec<Polygon<f64>> {
    match geometry {
        Geometry::Polygon(polygon) => vec![polygon],
        Geometry::MultiPolygon(multi) => multi.0,
        Geometry::GeometryCollection(collection) => {
            collection.0.into_iter().flat_map(polygons_of).collect()
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn square(name: &str, min_x: f64, min_y: f64, size: f64) -> Region {
        let polygon = Polygon::new(
            vec![
                (min_x, min_y),
                (min_x + size, min_y),
                (min_x + size, min_y + size),
                (min_x, min_y + size),
                (min_x, min_y),
            ]
            .into(),
            vec![],
        );
        Region {
            name: name.to_string(),
            shape: MultiPolygon::new(vec![polygon]),
        }
    }

    const ADMIN: &str = r#"{
        "type": "FeatureCollection",
        "features": [
            {
                "type": "Feature",
                "properties": { "ADM1_NAME": "Khartoum" },
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [[[0, 0], [20, 0], [20, 20], [0, 20], [0, 0]]]
                }
            },
            {
                "type": "Feature",
                "properties": { "ADM1_NAME": "Kassala" },
                "geometry": {
                    "type": "MultiPolygon",
                    "coordinates": [[[[20, 0], [40, 0], [40, 20], [20, 20], [20, 0]]]]
                }
            },
            {
                "type": "Feature",
                "properties": { "ADM1_NAME": "Gauge" },
                "geometry": { "type": "Point", "coordinates": [5, 5] }
            }
        ]
    }"#;

    #[test]
    fn admin_regions_are_named_and_point_features_skipped() {
        let regions = parse_admin(ADMIN, "ADM1_NAME").unwrap();
        let names: Vec<&str> = regions.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Khartoum", "Kassala"]);
    }

    #[test]
    fn missing_name_property_is_an_error() {
        assert!(parse_admin(ADMIN, "ADM2_NAME").is_err());
    }

    #[test]
    fn national_boundary_merges_all_polygons() {
        let national = parse_national(ADMIN, "Sudan").unwrap();
        assert_eq!(national.name, "Sudan");
        assert_eq!(national.shape.0.len(), 2);
        let bounds = national.bounds().unwrap();
        assert_eq!(bounds.max().x, 40.0);
    }

    #[test]
    fn mask_selects_pixel_centres_inside() {
        let grid = Grid::new(0.0, 20.0, 10.0, 10.0, 4, 2).unwrap();
        let regions = parse_admin(ADMIN, "ADM1_NAME").unwrap();

        let khartoum = regions[0].mask(&grid);
        assert_eq!(khartoum.iter().filter(|v| **v).count(), 4);
        assert!(khartoum[[0, 0]] && khartoum[[1, 1]]);
        assert!(!khartoum[[0, 2]]);

        let outside = square("far", 1000.0, 1000.0, 5.0).mask(&grid);
        assert!(outside.iter().all(|v| !*v));
    }
}

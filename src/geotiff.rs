use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use ndarray::Array2;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;
use tiff::ColorType;

use crate::raster::{is_valid, Grid, Raster, RasterError, NO_DATA};

const GT_MODEL_TYPE: u16 = 1024;
const GT_RASTER_TYPE: u16 = 1025;
const GEOGRAPHIC_TYPE: u16 = 2048;
const PROJECTED_CS_TYPE: u16 = 3072;

#[derive(Debug, Clone, Copy)]
pub struct GeoTiffOptions {
    pub epsg: u16,
    pub nodata: f64,
}

impl GeoTiffOptions {
    fn geo_keys(&self) -> Vec<u16> {
        let geographic = (4000..5000).contains(&self.epsg);
        let (model_type, crs_key) = if geographic {
            (2, GEOGRAPHIC_TYPE)
        } else {
            (1, PROJECTED_CS_TYPE)
        };

        // Header (version 1.1.0, 3 keys), then sorted key entries.
        let header = [1, 1, 0, 3];
        let entries = [
            [GT_MODEL_TYPE, 0, 1, model_type],
            [GT_RASTER_TYPE, 0, 1, 1],
            [crs_key, 0, 1, self.epsg],
        ];
        header.into_iter().chain(entries.into_iter().flatten()).collect()
    }
}

/// Reads the first band of a north-up GeoTIFF. The GDAL no-data value, if
/// tagged, is mapped to [`NO_DATA`].
pub fn read_geotiff(path: &Path) -> Result<Raster, RasterError> {
    let display = path.display().to_string();
    let reader = BufReader::new(File::open(path)?);
    let mut decoder = Decoder::new(reader)?.with_limits(Limits::unlimited());

    match decoder.colortype()? {
        ColorType::Gray(_) => {}
        other => {
            return Err(RasterError::UnsupportedLayout {
                path: display,
                layout: format!("{other:?}"),
            })
        }
    }

    let (width, height) = decoder.dimensions()?;

    let scale = decoder
        .find_tag(Tag::ModelPixelScaleTag)?
        .ok_or_else(|| RasterError::MissingGeoreference {
            path: display.clone(),
            tag: "ModelPixelScale",
        })?
        .into_f64_vec()?;
    let tiepoint = decoder
        .find_tag(Tag::ModelTiepointTag)?
        .ok_or_else(|| RasterError::MissingGeoreference {
            path: display.clone(),
            tag: "ModelTiepoint",
        })?
        .into_f64_vec()?;
    if scale.len() < 2 || tiepoint.len() < 6 {
        return Err(RasterError::MissingGeoreference {
            path: display,
            tag: "ModelPixelScale/ModelTiepoint",
        });
    }

    let nodata = match decoder.find_tag(Tag::GdalNodata)? {
        Some(value) => value
            .into_string()?
            .trim_matches(|c: char| c == '\0' || c.is_whitespace())
            .parse::<f64>()
            .ok(),
        None => None,
    };

    let (pixel_width, pixel_height) = (scale[0], scale[1]);
    let grid = Grid::new(
        tiepoint[3] - tiepoint[0] * pixel_width,
        tiepoint[4] + tiepoint[1] * pixel_height,
        pixel_width,
        pixel_height,
        width as usize,
        height as usize,
    )?;

    let samples = to_f32(decoder.read_image()?);
    let samples = match nodata {
        Some(nodata) => samples
            .into_iter()
            .map(|v| if (v as f64) == nodata { NO_DATA } else { v })
            .collect(),
        None => samples,
    };

    let data = Array2::from_shape_vec(grid.shape(), samples).map_err(|_| {
        RasterError::UnsupportedLayout {
            path: path.display().to_string(),
            layout: "sample count does not match image dimensions".to_string(),
        }
    })?;

    Raster::new(grid, data)
}

fn to_f32(result: DecodingResult) -> Vec<f32> {
    match result {
        DecodingResult::U8(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U16(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U64(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I8(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I16(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I64(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::F32(v) => v,
        DecodingResult::F64(v) => v.into_iter().map(|x| x as f32).collect(),
    }
}

/// Writes one float32 page per band, all sharing the grid of the first band.
/// Each page carries its band name as the image description.
pub fn write_geotiff(
    path: &Path,
    bands: &[(&str, &Raster)],
    options: &GeoTiffOptions,
) -> Result<(), RasterError> {
    let Some((_, first)) = bands.first() else {
        return Err(RasterError::InvalidGrid("no bands to write".to_string()));
    };
    let grid = first.grid;

    let writer = BufWriter::new(File::create(path)?);
    let mut encoder = TiffEncoder::new(writer)?;
    let geo_keys = options.geo_keys();
    let nodata = options.nodata.to_string();

    for (name, raster) in bands {
        if raster.grid != grid {
            return Err(RasterError::GridMismatch {
                expected: grid.shape(),
                found: raster.grid.shape(),
            });
        }

        let samples: Vec<f32> = raster
            .data
            .iter()
            .map(|&v| if is_valid(v) { v } else { options.nodata as f32 })
            .collect();

        let mut image =
            encoder.new_image::<colortype::Gray32Float>(grid.cols as u32, grid.rows as u32)?;
        let directory = image.encoder();
        directory.write_tag(Tag::ImageDescription, *name)?;
        directory.write_tag(
            Tag::ModelPixelScaleTag,
            &[grid.pixel_width, grid.pixel_height, 0.0][..],
        )?;
        directory.write_tag(
            Tag::ModelTiepointTag,
            &[0.0, 0.0, 0.0, grid.origin_x, grid.origin_y, 0.0][..],
        )?;
        directory.write_tag(Tag::GeoKeyDirectoryTag, &geo_keys[..])?;
        directory.write_tag(Tag::GdalNodata, nodata.as_str())?;
        image.write_data(&samples)?;
    }

    Ok(())
}

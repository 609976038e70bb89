//! Vector tile addressing and the PostGIS tile source

use std::time::Instant;

use async_trait::async_trait;
use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, DbErr, Statement};
use thiserror::Error;
use tracing::{debug, info};

/// Half the width of the world in EPSG:3857 metres
pub const WORLD_MERC_MAX: f64 = 20037508.3427892;

/// Each envelope edge is split into this many segments before reprojection
pub const DENSIFY_FACTOR: f64 = 4.0;

/// Deepest zoom accepted; keeps `2^z` inside a `u32`
pub const MAX_ZOOM: u32 = 30;

/// MVT extent and clip buffer, in tile units
const MVT_EXTENT: i32 = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordError {
    #[error("{field} must be a non-negative integer, got {value:?}")]
    NotAnInteger { field: &'static str, value: String },

    #[error("zoom {0} is deeper than the maximum of {MAX_ZOOM}")]
    ZoomOutOfRange(u32),

    #[error("tile {x}/{y} does not exist at zoom {z}")]
    OutOfRange { z: u32, x: u32, y: u32 },
}

/// XYZ tile address, origin top-left
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileCoord {
    pub z: u32,
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    pub fn new(z: u32, x: u32, y: u32) -> Result<Self, CoordError> {
        if z > MAX_ZOOM {
            return Err(CoordError::ZoomOutOfRange(z));
        }
        let tiles_per_side = 1u32 << z;
        if x >= tiles_per_side || y >= tiles_per_side {
            return Err(CoordError::OutOfRange { z, x, y });
        }
        Ok(Self { z, x, y })
    }

    /// Parse raw path segments
    pub fn parse(z: &str, x: &str, y: &str) -> Result<Self, CoordError> {
        Self::new(
            parse_component("z", z)?,
            parse_component("x", x)?,
            parse_component("y", y)?,
        )
    }

    /// Envelope of this tile in EPSG:3857
    pub fn bounds(&self) -> TileBounds {
        let world_size = WORLD_MERC_MAX * 2.0;
        let tile_size = world_size / f64::from(1u32 << self.z);
        let x = f64::from(self.x);
        let y = f64::from(self.y);

        TileBounds {
            xmin: -WORLD_MERC_MAX + tile_size * x,
            xmax: -WORLD_MERC_MAX + tile_size * (x + 1.0),
            ymin: WORLD_MERC_MAX - tile_size * (y + 1.0),
            ymax: WORLD_MERC_MAX - tile_size * y,
        }
    }
}

fn parse_component(field: &'static str, value: &str) -> Result<u32, CoordError> {
    value.parse().map_err(|_| CoordError::NotAnInteger {
        field,
        value: value.to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileBounds {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

impl TileBounds {
    pub fn segment_size(&self) -> f64 {
        (self.xmax - self.xmin) / DENSIFY_FACTOR
    }
}

#[derive(Debug, Error)]
pub enum TileError {
    #[error("database error: {0}")]
    Database(#[from] DbErr),

    #[error("tile query returned no rows")]
    Empty,
}

/// Anything that can render a Mapbox vector tile
#[async_trait]
pub trait TileSource: Send + Sync {
    async fn tile(&self, coord: TileCoord) -> Result<Vec<u8>, TileError>;
}

/// Renders tiles from the `osm_data` table with `ST_AsMVT`
pub struct PostgisTileSource {
    db: DatabaseConnection,
}

impl PostgisTileSource {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    fn statement(coord: TileCoord) -> Statement {
        let bounds = coord.bounds();
        let sql = format!(
            r#"
WITH
    bounds AS (
        SELECT ST_Segmentize(ST_MakeEnvelope($1, $2, $3, $4, 3857), $5) AS geom,
               ST_Segmentize(ST_MakeEnvelope($1, $2, $3, $4, 3857), $5)::box2d AS b2d
    ),
    mvtgeom AS (
        SELECT ST_AsMVTGeom(ST_Transform(t.geom, 3857), bounds.b2d, buffer => {extent}) AS geom,
               hstore_to_jsonb(tags) AS tags,
               t.osm_id AS id
        FROM osm_data t, bounds
        WHERE ST_Intersects(t.geom, ST_Transform(bounds.geom, 3857))
    )
SELECT ST_AsMVT(mvtgeom.*, 'default', {extent}, 'geom', 'id') AS mvt FROM mvtgeom"#,
            extent = MVT_EXTENT
        );

        Statement::from_sql_and_values(
            DbBackend::Postgres,
            sql,
            [
                bounds.xmin.into(),
                bounds.ymin.into(),
                bounds.xmax.into(),
                bounds.ymax.into(),
                bounds.segment_size().into(),
            ],
        )
    }
}

#[async_trait]
impl TileSource for PostgisTileSource {
    async fn tile(&self, coord: TileCoord) -> Result<Vec<u8>, TileError> {
        let statement = Self::statement(coord);
        debug!(z = coord.z, x = coord.x, y = coord.y, "Starting tile query");

        let query_start = Instant::now();
        let row = self.db.query_one(statement).await?;
        let query_ms = query_start.elapsed().as_millis() as u64;

        let row = row.ok_or(TileError::Empty)?;

        let scan_start = Instant::now();
        // ST_AsMVT over zero features may come back NULL
        let mvt: Option<Vec<u8>> = row.try_get("", "mvt")?;
        let scan_ms = scan_start.elapsed().as_millis() as u64;

        let mvt = mvt.unwrap_or_default();
        info!(
            z = coord.z,
            x = coord.x,
            y = coord.y,
            query_ms,
            scan_ms,
            bytes = mvt.len(),
            "Tile query succeeded"
        );
        Ok(mvt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_zoom_zero_covers_the_world() {
        let bounds = TileCoord::new(0, 0, 0).unwrap().bounds();
        assert!(approx(bounds.xmin, -WORLD_MERC_MAX));
        assert!(approx(bounds.xmax, WORLD_MERC_MAX));
        assert!(approx(bounds.ymin, -WORLD_MERC_MAX));
        assert!(approx(bounds.ymax, WORLD_MERC_MAX));
        assert!(approx(bounds.segment_size(), WORLD_MERC_MAX / 2.0));
    }

    #[test]
    fn test_origin_is_top_left() {
        let top_left = TileCoord::new(1, 0, 0).unwrap().bounds();
        assert!(approx(top_left.xmin, -WORLD_MERC_MAX));
        assert!(approx(top_left.xmax, 0.0));
        assert!(approx(top_left.ymin, 0.0));
        assert!(approx(top_left.ymax, WORLD_MERC_MAX));

        let bottom_right = TileCoord::new(1, 1, 1).unwrap().bounds();
        assert!(approx(bottom_right.xmin, 0.0));
        assert!(approx(bottom_right.ymax, 0.0));
        assert!(approx(bottom_right.ymin, -WORLD_MERC_MAX));
    }

    #[test]
    fn test_parse_rejects_non_integers() {
        for (z, x, y) in [("a", "0", "0"), ("1", "0.5", "0"), ("1", "0", "-1"), ("", "0", "0")] {
            assert!(matches!(
                TileCoord::parse(z, x, y),
                Err(CoordError::NotAnInteger { .. })
            ));
        }
        assert_eq!(
            TileCoord::parse("3", "7", "2").unwrap(),
            TileCoord { z: 3, x: 7, y: 2 }
        );
    }

    #[test]
    fn test_out_of_range_tiles() {
        assert_eq!(
            TileCoord::new(2, 4, 0),
            Err(CoordError::OutOfRange { z: 2, x: 4, y: 0 })
        );
        assert!(TileCoord::new(2, 3, 3).is_ok());
        assert_eq!(
            TileCoord::new(MAX_ZOOM + 1, 0, 0),
            Err(CoordError::ZoomOutOfRange(MAX_ZOOM + 1))
        );
        assert!(TileCoord::new(MAX_ZOOM, u32::MAX >> 2, 0).is_ok());
    }

    #[test]
    fn test_statement_binds_envelope() {
        let statement = PostgisTileSource::statement(TileCoord::new(0, 0, 0).unwrap());
        assert!(statement.sql.contains("FROM osm_data"));
        assert!(statement
            .sql
            .contains("ST_AsMVT(mvtgeom.*, 'default', 4096, 'geom', 'id')"));
        assert_eq!(statement.values.map(|v| v.0.len()), Some(5));
    }
}

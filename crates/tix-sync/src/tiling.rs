use serde::{Deserialize, Serialize};
use tix_core::BoundingBox;

/// Grid the TomTom incident API is queried over. Each tile stays under the
/// provider's 10,000 km² bbox limit at the default step.
pub const US_TILE_GRID: BoundingBox = BoundingBox {
    min_lat: 24.396308,
    max_lat: 49.384358,
    min_lon: -125.0,
    max_lon: -66.93457,
};

pub const DEFAULT_TILE_STEP: f64 = 0.85;

/// Bounding-box partitioning for feeds that only answer small regions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TilingConfig {
    #[serde(default = "default_grid")]
    pub grid: BoundingBox,
    #[serde(default = "default_step")]
    pub step: f64,
    #[serde(default = "default_param")]
    pub param: String,
}

fn default_grid() -> BoundingBox {
    US_TILE_GRID
}

fn default_step() -> f64 {
    DEFAULT_TILE_STEP
}

fn default_param() -> String {
    "bbox".to_string()
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            grid: default_grid(),
            step: default_step(),
            param: default_param(),
        }
    }
}

impl TilingConfig {
    /// Row-major tiles as `min_lon,min_lat,max_lon,max_lat`, two decimals.
    /// Edge tiles may overhang the grid by less than one step.
    pub fn tiles(&self) -> Vec<String> {
        let mut tiles = Vec::new();
        if !(self.step.is_finite() && self.step > 0.0) {
            return tiles;
        }
        let mut lat = self.grid.min_lat;
        while lat < self.grid.max_lat {
            let mut lon = self.grid.min_lon;
            while lon < self.grid.max_lon {
                tiles.push(format!(
                    "{:.2},{:.2},{:.2},{:.2}",
                    lon,
                    lat,
                    lon + self.step,
                    lat + self.step
                ));
                lon += self.step;
            }
            lat += self.step;
        }
        tiles
    }

    pub fn tile_urls(&self, base_url: &str) -> Vec<String> {
        let separator = if base_url.contains('?') { '&' } else { '?' };
        self.tiles()
            .into_iter()
            .map(|tile| format!("{base_url}{separator}{}={tile}", self.param))
            .collect()
    }
}

//! Shared context for one stage run and the per-tile runner.

use std::path::Path;

use log::{info, warn};
use parking_lot::Mutex;

use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::layout::{remove_temp_files, Layout};
use crate::raster::Grid;
use crate::record::StageTimer;
use crate::tile::{Bounds, TileId};
use crate::vector;

/// Outcome of running a closure over a set of tiles.
#[derive(Debug)]
pub struct TileRun<R> {
    /// Successful results, sorted by tile id.
    pub results: Vec<(TileId, R)>,
    /// Tiles whose closure returned an error, sorted by tile id.
    pub failures: Vec<(TileId, String)>,
}

impl<R> TileRun<R> {
    pub fn values(self) -> impl Iterator<Item = R> {
        self.results.into_iter().map(|(_, r)| r)
    }
}

pub struct Pipeline {
    config: Config,
    layout: Layout,
    threads: usize,
}

impl Pipeline {
    pub fn new(config: Config, threads: usize) -> Self {
        let layout = Layout::new(&config.data_dir, &config.country_name);
        Self {
            config,
            layout,
            threads: threads.max(1),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Extent of `TIL_<id>_<buffer_m>`. The unbuffered tile is snapped to
    /// whole degrees; buffered extents are used as they are.
    pub fn tile_bounds(&self, tile: &TileId, buffer_m: u32) -> Result<Bounds> {
        let geometry = vector::read_geometry(&self.layout.tile_vector(tile, buffer_m))?;
        let bounds = vector::envelope(&geometry);
        Ok(if buffer_m == 0 { bounds.rounded() } else { bounds })
    }

    /// The tile's grid at `target_res_deg`.
    pub fn tile_grid(&self, tile: &TileId) -> Result<Grid> {
        Grid::from_bounds(&self.tile_bounds(tile, 0)?, self.config.target_res_deg)
    }

    /// Runs `f` for every tile and collects the results. Errors are logged
    /// and recorded; they never stop the other tiles.
    pub fn for_each_tile<R, F>(&self, tiles: &[TileId], f: F) -> Result<TileRun<R>>
    where
        R: Send,
        F: Fn(&TileId) -> Result<R> + Sync,
    {
        run_tiles(self.threads, tiles, f)
    }

    /// Deletes intermediates once their consumer has run, unless the run
    /// keeps them.
    pub fn consume<P: AsRef<Path>>(&self, files: &[P]) {
        if self.config.keep_intermediates {
            return;
        }
        let existing: Vec<&Path> = files
            .iter()
            .map(|f| f.as_ref())
            .filter(|f| f.exists())
            .collect();
        remove_temp_files(&existing);
    }

    /// Runs a whole stage and appends its wall time to the timing log.
    pub fn timed<T>(&self, stage: &str, run: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        let timer = StageTimer::start(stage);
        let out = run(self)?;
        timer.finish(&self.layout.timing_log())?;
        Ok(out)
    }
}

/// Runs `f` for every tile on a pool of `threads` workers. Results and
/// failures come back sorted by tile id.
pub fn run_tiles<R, F>(threads: usize, tiles: &[TileId], f: F) -> Result<TileRun<R>>
where
    R: Send,
    F: Fn(&TileId) -> Result<R> + Sync,
{
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .build()
        .map_err(|e| PipelineError::Config(format!("thread pool: {e}")))?;
    let failures = Mutex::new(Vec::new());
    let (tx, rx) = flume::unbounded();

    pool.scope(|scope| {
        for tile in tiles {
            let tx = tx.clone();
            let f = &f;
            let failures = &failures;
            scope.spawn(move |_| {
                info!(">>> Processing tile: {tile}");
                match f(tile) {
                    Ok(result) => {
                        let _ = tx.send((*tile, result));
                    }
                    Err(e) => {
                        warn!("Tile {tile} failed: {e}");
                        failures.lock().push((*tile, e.to_string()));
                    }
                }
            });
        }
    });
    drop(tx);

    let mut results: Vec<(TileId, R)> = rx.into_iter().collect();
    results.sort_by(|a, b| a.0.cmp(&b.0));
    let mut failures = failures.into_inner();
    failures.sort_by(|a, b| a.0.cmp(&b.0));
    if !failures.is_empty() {
        warn!("{} of {} tiles failed", failures.len(), tiles.len());
    }
    Ok(TileRun { results, failures })
}

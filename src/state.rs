//! Year selection and map loading.
//!
//! `MapController` owns the current selection. Every `select` produces a new immutable
//! `Selection` snapshot, aborts the load for the previous one and publishes the finished
//! map on a watch channel. A load whose generation is no longer the latest is dropped
//! without being published.

use crate::config::AppConfig;
use crate::data;
use crate::lookup::MapIndex;
use crate::projection::Mercator;
use crate::render::Scene;
use crate::scale::SequentialScale;
use crate::types::{CountyFeature, PointFeature};
use anyhow::{bail, Result};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Selection {
    pub year: String,
    pub generation: u64,
}

/// Both map layers for one selection. A layer that failed to load is empty.
#[derive(Debug, Default)]
pub struct MapLayers {
    pub counties: Vec<CountyFeature>,
    pub points: Vec<PointFeature>,
    pub rejected_rows: usize,
}

pub struct RenderedMap {
    pub selection: Selection,
    pub counties: Vec<CountyFeature>,
    pub points: Vec<PointFeature>,
    pub rejected_rows: usize,
    pub scale: SequentialScale,
    pub scene: Scene,
    pub index: MapIndex,
}

pub type LayerFuture<'a> = Pin<Box<dyn Future<Output = MapLayers> + Send + 'a>>;

/// Where the layers for a year come from.
pub trait LayerSource: Send + Sync + 'static {
    fn load(&self, year: String) -> LayerFuture<'_>;
}

pub struct FileSource {
    config: Arc<AppConfig>,
}

impl FileSource {
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self { config }
    }
}

impl LayerSource for FileSource {
    fn load(&self, year: String) -> LayerFuture<'_> {
        Box::pin(async move { load_layers(&self.config, &year).await })
    }
}

/// Loads the county and station layers concurrently. Either may finish first; a failure
/// is logged and leaves only that layer empty.
pub async fn load_layers(config: &AppConfig, year: &str) -> MapLayers {
    let counties = data::load_counties_async(
        config.input.counties.clone(),
        config.input.state_fp.clone(),
        config.input.county_name_column.clone(),
    );
    let points = data::load_points(config.csv_path(year), config.input.csv.clone());

    let (counties, points) = tokio::join!(counties, points);

    let mut layers = MapLayers::default();
    match counties {
        Ok(c) => layers.counties = c,
        Err(e) => error!("Failed to load county boundaries: {:#}", e),
    }
    match points {
        Ok(conversion) => {
            layers.points = conversion.features;
            layers.rejected_rows = conversion.rejected.len();
        }
        Err(e) => error!("Failed to load station readings for {}: {:#}", year, e),
    }
    layers
}

pub fn build_map(config: &AppConfig, selection: Selection, layers: MapLayers) -> Result<RenderedMap> {
    let projection = Mercator::from_config(&config.projection)?;
    let scale = SequentialScale::for_points(&config.style, &layers.points)?;

    let mut scene = Scene::new(config.projection.width, config.projection.height);
    scene.draw_counties(&layers.counties, &projection);
    scene.draw_points(&layers.points, &projection, &scale);

    let index = MapIndex::build(&layers.counties, &layers.points);

    Ok(RenderedMap {
        selection,
        counties: layers.counties,
        points: layers.points,
        rejected_rows: layers.rejected_rows,
        scale,
        scene,
        index,
    })
}

pub type MapReceiver = watch::Receiver<Option<Arc<RenderedMap>>>;

pub struct MapController {
    config: Arc<AppConfig>,
    source: Arc<dyn LayerSource>,
    current: Selection,
    latest: Arc<AtomicU64>,
    in_flight: Option<JoinHandle<()>>,
    tx: Arc<watch::Sender<Option<Arc<RenderedMap>>>>,
}

impl MapController {
    /// Creates the controller on the configured default year. Nothing is loaded until
    /// the first `select`.
    pub fn new(config: Arc<AppConfig>, source: Arc<dyn LayerSource>) -> Self {
        let (tx, _rx) = watch::channel(None);
        let current = Selection {
            year: config.input.default_year.clone(),
            generation: 0,
        };
        Self {
            config,
            source,
            current,
            latest: Arc::new(AtomicU64::new(0)),
            in_flight: None,
            tx: Arc::new(tx),
        }
    }

    pub fn with_files(config: Arc<AppConfig>) -> Self {
        let source = Arc::new(FileSource::new(config.clone()));
        Self::new(config, source)
    }

    pub fn selection(&self) -> &Selection {
        &self.current
    }

    pub fn years(&self) -> &[String] {
        &self.config.input.years
    }

    pub fn subscribe(&self) -> MapReceiver {
        self.tx.subscribe()
    }

    pub fn current_map(&self) -> Option<Arc<RenderedMap>> {
        self.tx.borrow().clone()
    }

    /// Switches to `year` and starts loading it, cancelling any load still running.
    pub fn select(&mut self, year: &str) -> Result<Selection> {
        if !self.config.has_year(year) {
            bail!("Unknown year: {}", year);
        }

        let selection = Selection {
            year: year.to_string(),
            generation: self.current.generation + 1,
        };
        self.current = selection.clone();
        self.latest.store(selection.generation, Ordering::SeqCst);

        if let Some(handle) = self.in_flight.take() {
            handle.abort();
        }

        let config = self.config.clone();
        let source = self.source.clone();
        let latest = self.latest.clone();
        let tx = self.tx.clone();
        let snapshot = selection.clone();

        self.in_flight = Some(tokio::spawn(async move {
            let layers = source.load(snapshot.year.clone()).await;
            if latest.load(Ordering::SeqCst) != snapshot.generation {
                return;
            }
            match build_map(&config, snapshot, layers) {
                Ok(map) => {
                    info!(
                        year = %map.selection.year,
                        counties = map.counties.len(),
                        stations = map.points.len(),
                        rejected = map.rejected_rows,
                        "map ready"
                    );
                    let map = Arc::new(map);
                    tx.send_if_modified(|current| {
                        if latest.load(Ordering::SeqCst) != map.selection.generation {
                            return false;
                        }
                        *current = Some(map.clone());
                        true
                    });
                }
                Err(e) => error!("Failed to build map: {:#}", e),
            }
        }));

        Ok(selection)
    }
}

impl Drop for MapController {
    fn drop(&mut self) {
        if let Some(handle) = self.in_flight.take() {
            handle.abort();
        }
    }
}

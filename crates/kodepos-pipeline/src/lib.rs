//! Harvest orchestration: batch scheduling, raw-record aggregation with
//! synthetic ID assignment, and projection output.
//!
//! The pipeline runs as a one-shot batch job in two stages. `harvest`
//! drives the remote source page by page under a concurrency cap and
//! stages every page's rows; `build` replays the staged pages into the
//! aggregation engine and writes the six output artifacts. Either stage
//! completes fully or the run aborts on the first fault.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use kodepos_core::{
    District, DistrictItem, EntityKind, Province, ProvinceItem, Regency, RegencyItem,
    RegencyKey, RegencyRecord, Village, VillageItem, VillageRecord,
};
use kodepos_source::{
    load_province_records, load_regency_records, load_village_records, page_windows,
    KodeposSource, PageQuery, PageSource, SourceError,
};
use kodepos_storage::{
    HttpClientConfig, PageKey, PageStore, StagingError, StoredPage,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "kodepos-pipeline";

/// Run configuration, loaded from `kodepos.yaml` when present.
///
/// The defaults mirror the known source totals; they are inputs to page
/// arithmetic, not discovered at runtime, so a change on the source side
/// means updating the config.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub base_url: String,
    pub staging_dir: PathBuf,
    pub output_dir: PathBuf,
    pub page_size: usize,
    /// Fetches launched concurrently per scheduler group.
    pub concurrency: usize,
    /// Pause between scheduler groups, to stay under the source's
    /// implicit rate limit.
    pub cooldown_secs: u64,
    pub max_provinces: usize,
    pub max_regencies_per_province: usize,
    pub max_villages: usize,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            base_url: "http://kodepos.nomor.net/_kodepos.php".to_string(),
            staging_dir: PathBuf::from("./staging"),
            output_dir: PathBuf::from("./output"),
            page_size: 100,
            concurrency: 5,
            cooldown_secs: 5,
            max_provinces: 34,
            max_regencies_per_province: 9,
            max_villages: 82_505,
            user_agent: "kodepos-harvester/0.1".to_string(),
            http_timeout_secs: 20,
        }
    }
}

impl HarvestConfig {
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Staging(#[from] StagingError),
    #[error("page task failed to join: {0}")]
    Join(String),
}

/// Drives page fetches in bounded groups with a join barrier per group.
///
/// Groups run strictly in sequence; pages within a group run concurrently
/// with no ordering guarantee, which is safe because every page writes to
/// its own staging key. The first failing page aborts the remaining
/// in-flight fetches and fails the whole scope.
#[derive(Debug, Clone, Copy)]
pub struct BatchScheduler {
    concurrency: usize,
    cooldown: Duration,
}

impl BatchScheduler {
    pub fn new(concurrency: usize, cooldown: Duration) -> Self {
        Self {
            concurrency: concurrency.max(1),
            cooldown,
        }
    }

    /// Fetch and stage every page window of one entity scope, then record
    /// the scope's staging manifest.
    pub async fn stage_scope(
        &self,
        source: Arc<dyn PageSource>,
        store: &PageStore,
        kind: EntityKind,
        parent: Option<&str>,
        total: usize,
        page_size: usize,
    ) -> Result<Vec<StoredPage>, StageError> {
        let windows = page_windows(total, page_size);
        info!(
            kind = %kind,
            parent = parent.unwrap_or("-"),
            pages = windows.len(),
            concurrency = self.concurrency,
            "staging scope"
        );

        let mut staged = Vec::with_capacity(windows.len());
        for (group_index, group) in windows.chunks(self.concurrency).enumerate() {
            if group_index > 0 && !self.cooldown.is_zero() {
                tokio::time::sleep(self.cooldown).await;
            }

            let mut tasks: JoinSet<Result<StoredPage, StageError>> = JoinSet::new();
            for window in group {
                let source = Arc::clone(&source);
                let store = store.clone();
                let query = PageQuery {
                    kind,
                    page_size,
                    window: *window,
                    parent: parent.map(str::to_string),
                };
                let key = PageKey {
                    kind,
                    page: window.index,
                    parent: parent.map(str::to_string),
                };
                tasks.spawn(async move {
                    let rows = source.fetch_rows(&query).await?;
                    Ok(store.write_page(&key, &rows).await?)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok(page)) => staged.push(page),
                    Ok(Err(err)) => {
                        tasks.abort_all();
                        return Err(err);
                    }
                    Err(join_err) => {
                        tasks.abort_all();
                        return Err(StageError::Join(join_err.to_string()));
                    }
                }
            }
        }

        staged.sort_by_key(|page| page.page);
        store.write_manifest(kind, parent, &staged).await?;
        Ok(staged)
    }
}

/// Read-only lookup from a regency's composite key to its owning
/// province's name, built from the regency harvest and consumed while
/// aggregating village records.
#[derive(Debug, Default)]
pub struct RegencyIndex {
    by_key: HashMap<String, String>,
}

impl RegencyIndex {
    pub fn from_records(records: &[RegencyRecord]) -> Self {
        let mut by_key = HashMap::with_capacity(records.len());
        for record in records {
            by_key.insert(record.regency.lookup_key(), record.province.clone());
        }
        Self { by_key }
    }

    pub fn province_of(&self, regency: &RegencyKey) -> Option<&str> {
        self.by_key.get(&regency.lookup_key()).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

/// Known misspellings in the source data, rewritten to the canonical name
/// before any dedup key is computed. Not assumed exhaustive; new entries
/// are data changes, not code changes.
const DISTRICT_NAME_CORRECTIONS: &[(&str, &str)] = &[("Kinovaru", "Kinovaro")];

fn canonical_district_name(name: &str) -> &str {
    DISTRICT_NAME_CORRECTIONS
        .iter()
        .find(|(wrong, _)| *wrong == name)
        .map(|(_, corrected)| *corrected)
        .unwrap_or(name)
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("village {village:?} references regency {regency:?} absent from the regency harvest")]
    UnknownRegency { regency: String, village: String },
}

/// Creation-ordered scope tree the aggregation engine accumulates into.
///
/// Every level keeps an append-ordered list of child scopes plus a
/// name-to-index map for O(1) dedup; synthetic IDs are later assigned by
/// walking the append order, never by iterating a map.
#[derive(Debug, Default)]
pub struct ScopeTree {
    provinces: Vec<ProvinceScope>,
    index: HashMap<String, usize>,
}

#[derive(Debug)]
struct ProvinceScope {
    name: String,
    regencies: Vec<RegencyScope>,
    index: HashMap<String, usize>,
}

#[derive(Debug)]
struct RegencyScope {
    name: String,
    districts: Vec<DistrictScope>,
    index: HashMap<String, usize>,
}

#[derive(Debug)]
struct DistrictScope {
    name: String,
    villages: Vec<VillageScope>,
    index: HashMap<String, usize>,
}

#[derive(Debug)]
struct VillageScope {
    name: String,
    zip_code: String,
}

impl ScopeTree {
    /// Fold one village record into the tree, creating any missing
    /// enclosing scopes on first occurrence.
    pub fn ingest(
        &mut self,
        record: &VillageRecord,
        regencies: &RegencyIndex,
    ) -> Result<(), BuildError> {
        let district_name = canonical_district_name(&record.district);
        let province_name = regencies
            .province_of(&record.regency)
            .ok_or_else(|| BuildError::UnknownRegency {
                regency: record.regency.lookup_key(),
                village: record.village.clone(),
            })?
            .to_string();

        let province_idx = match self.index.get(&province_name) {
            Some(&idx) => idx,
            None => {
                self.provinces.push(ProvinceScope {
                    name: province_name.clone(),
                    regencies: Vec::new(),
                    index: HashMap::new(),
                });
                let idx = self.provinces.len() - 1;
                self.index.insert(province_name, idx);
                idx
            }
        };

        self.provinces[province_idx]
            .regency_scope(record.regency.lookup_key())
            .district_scope(district_name)
            .record_village(&record.village, &record.zip_code);
        Ok(())
    }

    /// Walk the tree once in creation order, assigning dense per-level IDs
    /// and emitting the linked tree plus the flat projections.
    pub fn into_dataset(self) -> Dataset {
        let mut dataset = Dataset::default();
        let (mut province_id, mut regency_id, mut district_id, mut village_id) =
            (1u32, 1u32, 1u32, 1u32);

        for province in self.provinces {
            let mut regencies = Vec::with_capacity(province.regencies.len());
            for regency in province.regencies {
                let mut districts = Vec::with_capacity(regency.districts.len());
                for district in regency.districts {
                    let mut villages = Vec::with_capacity(district.villages.len());
                    for village in district.villages {
                        villages.push(Village {
                            id: village_id,
                            district_id,
                            regency_id,
                            province_id,
                            name: village.name.clone(),
                            zip_code: village.zip_code.clone(),
                        });
                        dataset
                            .villages_by_district
                            .entry(district_id.to_string())
                            .or_default()
                            .push(VillageItem {
                                id: village_id,
                                name: village.name,
                                zip_code: village.zip_code.clone(),
                            });
                        dataset
                            .zip_code_by_village
                            .insert(village_id.to_string(), village.zip_code);
                        village_id += 1;
                    }
                    districts.push(District {
                        id: district_id,
                        regency_id,
                        province_id,
                        name: district.name.clone(),
                        villages,
                    });
                    dataset
                        .districts_by_regency
                        .entry(regency_id.to_string())
                        .or_default()
                        .push(DistrictItem {
                            id: district_id,
                            name: district.name,
                        });
                    district_id += 1;
                }
                regencies.push(Regency {
                    id: regency_id,
                    province_id,
                    name: regency.name.clone(),
                    districts,
                });
                dataset
                    .regencies_by_province
                    .entry(province_id.to_string())
                    .or_default()
                    .push(RegencyItem {
                        id: regency_id,
                        name: regency.name,
                    });
                regency_id += 1;
            }
            dataset.tree.push(Province {
                id: province_id,
                name: province.name.clone(),
                regencies,
            });
            dataset.provinces.push(ProvinceItem {
                id: province_id,
                name: province.name,
            });
            province_id += 1;
        }

        dataset
    }
}

impl ProvinceScope {
    fn regency_scope(&mut self, name: String) -> &mut RegencyScope {
        let idx = match self.index.get(&name) {
            Some(&idx) => idx,
            None => {
                self.regencies.push(RegencyScope {
                    name: name.clone(),
                    districts: Vec::new(),
                    index: HashMap::new(),
                });
                let idx = self.regencies.len() - 1;
                self.index.insert(name, idx);
                idx
            }
        };
        &mut self.regencies[idx]
    }
}

impl RegencyScope {
    fn district_scope(&mut self, name: &str) -> &mut DistrictScope {
        let idx = match self.index.get(name) {
            Some(&idx) => idx,
            None => {
                self.districts.push(DistrictScope {
                    name: name.to_string(),
                    villages: Vec::new(),
                    index: HashMap::new(),
                });
                let idx = self.districts.len() - 1;
                self.index.insert(name.to_string(), idx);
                idx
            }
        };
        &mut self.districts[idx]
    }
}

impl DistrictScope {
    /// First write wins; a later conflicting zip for the same village is
    /// kept out of the output but surfaced in the log.
    fn record_village(&mut self, name: &str, zip_code: &str) {
        match self.index.get(name) {
            Some(&idx) => {
                let existing = &self.villages[idx];
                if existing.zip_code != zip_code {
                    warn!(
                        district = %self.name,
                        village = %name,
                        kept = %existing.zip_code,
                        ignored = %zip_code,
                        "conflicting zip code for village; keeping first"
                    );
                }
            }
            None => {
                self.villages.push(VillageScope {
                    name: name.to_string(),
                    zip_code: zip_code.to_string(),
                });
                self.index.insert(name.to_string(), self.villages.len() - 1);
            }
        }
    }
}

/// The six output projections, produced together in one tree walk.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Dataset {
    pub tree: Vec<Province>,
    pub provinces: Vec<ProvinceItem>,
    pub regencies_by_province: BTreeMap<String, Vec<RegencyItem>>,
    pub districts_by_regency: BTreeMap<String, Vec<DistrictItem>>,
    pub villages_by_district: BTreeMap<String, Vec<VillageItem>>,
    pub zip_code_by_village: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("encoding artifact {name}: {source}")]
    Encode {
        name: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("writing artifact {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub const TREE_ARTIFACT: &str = "zip_codes.json";
pub const PROVINCES_ARTIFACT: &str = "provinces.json";
pub const REGENCIES_ARTIFACT: &str = "regencies_by_province.json";
pub const DISTRICTS_ARTIFACT: &str = "districts_by_regency.json";
pub const VILLAGES_ARTIFACT: &str = "villages_by_district.json";
pub const ZIP_MAP_ARTIFACT: &str = "zip_code_map.json";

/// Serializes the dataset to its six artifact documents. Pure boundary
/// adapter; any write failure is fatal to the run.
#[derive(Debug, Clone)]
pub struct ProjectionWriter {
    dir: PathBuf,
}

impl ProjectionWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub async fn write_all(&self, dataset: &Dataset) -> Result<Vec<PathBuf>, OutputError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| OutputError::Write {
                path: self.dir.clone(),
                source,
            })?;

        Ok(vec![
            self.write_json(TREE_ARTIFACT, &dataset.tree).await?,
            self.write_json(PROVINCES_ARTIFACT, &dataset.provinces).await?,
            self.write_json(REGENCIES_ARTIFACT, &dataset.regencies_by_province)
                .await?,
            self.write_json(DISTRICTS_ARTIFACT, &dataset.districts_by_regency)
                .await?,
            self.write_json(VILLAGES_ARTIFACT, &dataset.villages_by_district)
                .await?,
            self.write_json(ZIP_MAP_ARTIFACT, &dataset.zip_code_by_village)
                .await?,
        ])
    }

    async fn write_json<T: Serialize>(
        &self,
        name: &'static str,
        value: &T,
    ) -> Result<PathBuf, OutputError> {
        let bytes =
            serde_json::to_vec_pretty(value).map_err(|source| OutputError::Encode { name, source })?;
        let path = self.dir.join(name);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|source| OutputError::Write {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub province_pages: usize,
    pub regency_scopes: usize,
    pub regency_pages: usize,
    pub village_pages: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub provinces: usize,
    pub regencies: usize,
    pub districts: usize,
    pub villages: usize,
    pub artifacts: Vec<PathBuf>,
}

/// Top-level harvest-then-build orchestration.
pub struct HarvestPipeline {
    config: HarvestConfig,
    store: PageStore,
    source: Arc<dyn PageSource>,
    scheduler: BatchScheduler,
}

impl HarvestPipeline {
    pub fn new(config: HarvestConfig) -> Result<Self> {
        let source = KodeposSource::new(&config.base_url, config.http_config())
            .context("building kodepos source")?;
        Ok(Self::with_source(config, Arc::new(source)))
    }

    /// Construct with an explicit page source; the seam tests use to run
    /// the pipeline without a network.
    pub fn with_source(config: HarvestConfig, source: Arc<dyn PageSource>) -> Self {
        let store = PageStore::new(config.staging_dir.clone());
        let scheduler = BatchScheduler::new(config.concurrency, config.cooldown());
        Self {
            config,
            store,
            source,
            scheduler,
        }
    }

    /// Stage every page of every entity scope: provinces first, then each
    /// known province's regencies, then villages.
    pub async fn harvest(&self) -> Result<HarvestSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, "harvest started");

        let province_pages = self
            .scheduler
            .stage_scope(
                Arc::clone(&self.source),
                &self.store,
                EntityKind::Province,
                None,
                self.config.max_provinces,
                self.config.page_size,
            )
            .await
            .context("staging province pages")?;

        let provinces = load_province_records(&self.store, province_pages.len())
            .await
            .context("loading staged province records")?;
        info!(provinces = provinces.len(), "province harvest complete");

        let mut regency_pages = 0usize;
        for province in &provinces {
            let staged = self
                .scheduler
                .stage_scope(
                    Arc::clone(&self.source),
                    &self.store,
                    EntityKind::Regency,
                    Some(&province.name),
                    self.config.max_regencies_per_province,
                    self.config.page_size,
                )
                .await
                .with_context(|| format!("staging regency pages for {}", province.name))?;
            regency_pages += staged.len();
        }

        let village_pages = self
            .scheduler
            .stage_scope(
                Arc::clone(&self.source),
                &self.store,
                EntityKind::Village,
                None,
                self.config.max_villages,
                self.config.page_size,
            )
            .await
            .context("staging village pages")?;

        let summary = HarvestSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            province_pages: province_pages.len(),
            regency_scopes: provinces.len(),
            regency_pages,
            village_pages: village_pages.len(),
        };
        info!(
            province_pages = summary.province_pages,
            regency_pages = summary.regency_pages,
            village_pages = summary.village_pages,
            "harvest finished"
        );
        Ok(summary)
    }

    /// Aggregate the staged pages into the linked tree and write all six
    /// artifacts. No artifact is valid unless every one was written.
    pub async fn build(&self) -> Result<BuildSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, "build started");

        let province_page_count =
            page_windows(self.config.max_provinces, self.config.page_size).len();
        let regency_page_count =
            page_windows(self.config.max_regencies_per_province, self.config.page_size).len();
        let village_page_count =
            page_windows(self.config.max_villages, self.config.page_size).len();

        let provinces = load_province_records(&self.store, province_page_count)
            .await
            .context("loading staged province records")?;

        let mut regency_records = Vec::new();
        for province in &provinces {
            let records = load_regency_records(&self.store, &province.name, regency_page_count)
                .await
                .with_context(|| format!("loading staged regency records for {}", province.name))?;
            regency_records.extend(records);
        }
        let regency_index = RegencyIndex::from_records(&regency_records);
        info!(regencies = regency_index.len(), "regency resolver built");

        let village_records = load_village_records(&self.store, village_page_count)
            .await
            .context("loading staged village records")?;

        let mut tree = ScopeTree::default();
        for record in &village_records {
            tree.ingest(record, &regency_index)
                .context("aggregating village records")?;
        }
        let dataset = tree.into_dataset();

        let writer = ProjectionWriter::new(self.config.output_dir.clone());
        let artifacts = writer
            .write_all(&dataset)
            .await
            .context("writing output artifacts")?;

        let summary = BuildSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            provinces: dataset.provinces.len(),
            regencies: dataset
                .regencies_by_province
                .values()
                .map(Vec::len)
                .sum(),
            districts: dataset
                .districts_by_regency
                .values()
                .map(Vec::len)
                .sum(),
            villages: dataset.zip_code_by_village.len(),
            artifacts,
        };
        info!(
            provinces = summary.provinces,
            regencies = summary.regencies,
            districts = summary.districts,
            villages = summary.villages,
            "build finished"
        );
        Ok(summary)
    }

    pub async fn run(&self) -> Result<(HarvestSummary, BuildSummary)> {
        let harvest = self.harvest().await?;
        let build = self.build().await?;
        Ok((harvest, build))
    }
}

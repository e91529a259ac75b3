//! Remote source boundary: page-window arithmetic, source URL building,
//! HTML row extraction, and the staged-record loader.
//!
//! The source paginates each entity type by a 1-based entity range
//! (`no1..no2`); one fetched page renders one entity per fixed-size run of
//! table cells. Everything downstream works on the extracted text rows,
//! so this crate is the only place that knows about markup.

use async_trait::async_trait;
use kodepos_core::{
    EntityKind, ProvinceRecord, RegencyKey, RegencyRecord, VillageRecord, PROVINCE_LAYOUT,
    REGENCY_LAYOUT, VILLAGE_LAYOUT,
};
use kodepos_storage::{FetchError, HttpClientConfig, HttpFetcher, PageStore, StagingError};
use reqwest::Url;
use scraper::{Html, Selector};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "kodepos-source";

/// One page's 1-based entity window.
///
/// Page `index` (0-based, also the staging key) covers entities
/// `[index*page_size + 1, (index+1)*page_size]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageWindow {
    pub index: usize,
    pub start: usize,
    pub end: usize,
}

/// Windows needed to cover `total` entities, in index order.
///
/// Uses a ceiling page count, so a total that is an exact multiple of the
/// page size never produces an empty trailing window.
pub fn page_windows(total: usize, page_size: usize) -> Vec<PageWindow> {
    let page_size = page_size.max(1);
    (0..total.div_ceil(page_size))
        .map(|index| PageWindow {
            index,
            start: index * page_size + 1,
            end: (index + 1) * page_size,
        })
        .collect()
}

/// Everything needed to fetch one page of one entity scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageQuery {
    pub kind: EntityKind,
    pub page_size: usize,
    pub window: PageWindow,
    /// Province name filter, required for regency pages.
    pub parent: Option<String>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("invalid source base url {url:?}: {message}")]
    BaseUrl { url: String, message: String },
    #[error("regency page query is missing its province filter")]
    MissingParent,
    #[error("invalid selector: {0}")]
    Selector(String),
    #[error("results table not found in fetched page")]
    MissingResultsTable,
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Seam between the batch scheduler and the remote source.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Fetch one page and return its extracted text rows.
    async fn fetch_rows(&self, query: &PageQuery) -> Result<Vec<String>, SourceError>;
}

// CSS path to the results table on every listing page; the third table at
// this depth holds the data rows.
const RESULTS_TABLE: &str = "html > body > table > tbody > tr > td > table > tbody > tr > td \
                             > table > tbody > tr > td > table";
const RESULTS_CELL: &str = "tr[bgcolor='#ccffff'] > td";

/// The kodepos.nomor.net listing endpoint.
#[derive(Debug)]
pub struct KodeposSource {
    base: Url,
    fetcher: HttpFetcher,
}

impl KodeposSource {
    pub fn new(base_url: &str, http: HttpClientConfig) -> Result<Self, SourceError> {
        let base = Url::parse(base_url).map_err(|err| SourceError::BaseUrl {
            url: base_url.to_string(),
            message: err.to_string(),
        })?;
        let fetcher = HttpFetcher::new(http)?;
        Ok(Self { base, fetcher })
    }

    pub fn page_url(&self, query: &PageQuery) -> Result<Url, SourceError> {
        let mut url = self.base.clone();
        let page_size = query.page_size.to_string();
        let no1 = query.window.start.to_string();
        let no2 = query.window.end.to_string();
        {
            let mut pairs = url.query_pairs_mut();
            match query.kind {
                EntityKind::Province => {
                    pairs
                        .append_pair("_i", "provinsi-kodepos")
                        .append_pair("daerah", "")
                        .append_pair("jobs", "")
                        .append_pair("perhal", &page_size)
                        .append_pair("sby", "000000")
                        .append_pair("no1", &no1)
                        .append_pair("no2", &no2);
                }
                EntityKind::Regency => {
                    let province = query.parent.as_deref().ok_or(SourceError::MissingParent)?;
                    pairs
                        .append_pair("_i", "kota-kodepos")
                        .append_pair("daerah", "Provinsi")
                        .append_pair("perhal", &page_size)
                        .append_pair("sby", "000000")
                        .append_pair("no1", &no1)
                        .append_pair("no2", &no2)
                        .append_pair("jobs", province);
                }
                EntityKind::Village => {
                    pairs
                        .append_pair("_i", "desa-kodepos")
                        .append_pair("perhal", &page_size)
                        .append_pair("sby", "000000")
                        .append_pair("no1", &no1)
                        .append_pair("no2", &no2);
                }
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl PageSource for KodeposSource {
    async fn fetch_rows(&self, query: &PageQuery) -> Result<Vec<String>, SourceError> {
        let url = self.page_url(query)?;
        let html = self.fetcher.fetch_text(url).await?;
        let rows = extract_rows(&html)?;
        debug!(
            kind = %query.kind,
            page = query.window.index,
            rows = rows.len(),
            "extracted page rows"
        );
        Ok(rows)
    }
}

/// Pull the data rows out of one fetched listing page.
///
/// Cell text is kept verbatim; the source pads some fields with leading
/// whitespace that is significant to record parsing downstream.
pub fn extract_rows(html: &str) -> Result<Vec<String>, SourceError> {
    let table_selector =
        Selector::parse(RESULTS_TABLE).map_err(|e| SourceError::Selector(e.to_string()))?;
    let cell_selector =
        Selector::parse(RESULTS_CELL).map_err(|e| SourceError::Selector(e.to_string()))?;

    let document = Html::parse_document(html);
    let table = document
        .select(&table_selector)
        .nth(2)
        .ok_or(SourceError::MissingResultsTable)?;

    Ok(table
        .select(&cell_selector)
        .map(|cell| cell.text().collect::<String>())
        .collect())
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Staging(#[from] StagingError),
    #[error("staged {kind} page {page} has {rows} rows, not a multiple of {fields_per_record}")]
    Alignment {
        kind: EntityKind,
        page: usize,
        rows: usize,
        fields_per_record: usize,
    },
    #[error("village zip line has no third token: {line:?}")]
    MalformedZipLine { line: String },
}

/// Concatenate staged pages into one row sequence, verifying that every
/// page's row count is an exact multiple of the record width. A misaligned
/// page means the scrape captured partial records and all downstream
/// offset arithmetic would silently read the wrong fields.
fn aligned_rows(pages: Vec<Vec<String>>, kind: EntityKind) -> Result<Vec<String>, LoadError> {
    let fields_per_record = kind.fields_per_record();
    let mut rows = Vec::new();
    for (page, page_rows) in pages.into_iter().enumerate() {
        if page_rows.len() % fields_per_record != 0 {
            return Err(LoadError::Alignment {
                kind,
                page,
                rows: page_rows.len(),
                fields_per_record,
            });
        }
        rows.extend(page_rows);
    }
    Ok(rows)
}

pub async fn load_province_records(
    store: &PageStore,
    page_count: usize,
) -> Result<Vec<ProvinceRecord>, LoadError> {
    let pages = store.read_pages(EntityKind::Province, None, page_count).await?;
    let rows = aligned_rows(pages, EntityKind::Province)?;
    Ok(rows
        .chunks_exact(PROVINCE_LAYOUT.fields_per_record)
        .map(|group| ProvinceRecord {
            name: group[PROVINCE_LAYOUT.name].clone(),
        })
        .collect())
}

pub async fn load_regency_records(
    store: &PageStore,
    province: &str,
    page_count: usize,
) -> Result<Vec<RegencyRecord>, LoadError> {
    let pages = store
        .read_pages(EntityKind::Regency, Some(province), page_count)
        .await?;
    let rows = aligned_rows(pages, EntityKind::Regency)?;
    Ok(rows
        .chunks_exact(REGENCY_LAYOUT.fields_per_record)
        .map(|group| RegencyRecord {
            province: group[REGENCY_LAYOUT.province].clone(),
            regency: RegencyKey::new(
                group[REGENCY_LAYOUT.prefix].clone(),
                group[REGENCY_LAYOUT.name].clone(),
            ),
        })
        .collect())
}

pub async fn load_village_records(
    store: &PageStore,
    page_count: usize,
) -> Result<Vec<VillageRecord>, LoadError> {
    let pages = store.read_pages(EntityKind::Village, None, page_count).await?;
    let rows = aligned_rows(pages, EntityKind::Village)?;
    rows.chunks_exact(VILLAGE_LAYOUT.fields_per_record)
        .map(|group| {
            let zip_line = &group[VILLAGE_LAYOUT.zip_line];
            let zip_code = zip_line
                .split_whitespace()
                .nth(2)
                .ok_or_else(|| LoadError::MalformedZipLine {
                    line: zip_line.clone(),
                })?;
            Ok(VillageRecord {
                zip_code: zip_code.to_string(),
                village: group[VILLAGE_LAYOUT.village].clone(),
                district: group[VILLAGE_LAYOUT.district].clone(),
                regency: RegencyKey::new(
                    group[VILLAGE_LAYOUT.regency_prefix].clone(),
                    group[VILLAGE_LAYOUT.regency_name].clone(),
                ),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kodepos_storage::PageKey;
    use tempfile::tempdir;

    #[test]
    fn windows_cover_the_entity_range_exactly_once() {
        let windows = page_windows(250, 100);
        assert_eq!(
            windows,
            vec![
                PageWindow { index: 0, start: 1, end: 100 },
                PageWindow { index: 1, start: 101, end: 200 },
                PageWindow { index: 2, start: 201, end: 300 },
            ]
        );
    }

    #[test]
    fn exact_multiple_total_has_no_empty_trailing_window() {
        assert_eq!(page_windows(200, 100).len(), 2);
        assert_eq!(page_windows(100, 100).len(), 1);
        assert_eq!(page_windows(0, 100).len(), 0);
    }

    #[test]
    fn small_total_still_gets_one_full_window() {
        let windows = page_windows(34, 100);
        assert_eq!(windows, vec![PageWindow { index: 0, start: 1, end: 100 }]);
    }

    fn source() -> KodeposSource {
        KodeposSource::new(
            "http://kodepos.nomor.net/_kodepos.php",
            HttpClientConfig::default(),
        )
        .expect("source")
    }

    #[test]
    fn province_page_url_carries_the_entity_window() {
        let url = source()
            .page_url(&PageQuery {
                kind: EntityKind::Province,
                page_size: 100,
                window: PageWindow { index: 0, start: 1, end: 100 },
                parent: None,
            })
            .expect("url");
        let query = url.query().expect("query");
        assert!(query.contains("_i=provinsi-kodepos"));
        assert!(query.contains("perhal=100"));
        assert!(query.contains("no1=1"));
        assert!(query.contains("no2=100"));
    }

    #[test]
    fn regency_page_url_escapes_the_province_filter() {
        let url = source()
            .page_url(&PageQuery {
                kind: EntityKind::Regency,
                page_size: 100,
                window: PageWindow { index: 0, start: 1, end: 100 },
                parent: Some("Jawa Barat".to_string()),
            })
            .expect("url");
        let query = url.query().expect("query");
        assert!(query.contains("_i=kota-kodepos"));
        assert!(query.contains("daerah=Provinsi"));
        assert!(query.contains("jobs=Jawa+Barat"));
    }

    #[test]
    fn regency_page_url_requires_a_parent() {
        let err = source()
            .page_url(&PageQuery {
                kind: EntityKind::Regency,
                page_size: 100,
                window: PageWindow { index: 0, start: 1, end: 100 },
                parent: None,
            })
            .expect_err("no parent");
        assert!(matches!(err, SourceError::MissingParent));
    }

    fn listing_page(cells: &[&str]) -> String {
        let rows = cells
            .iter()
            .map(|c| format!("<tr bgcolor='#ccffff'><td>{c}</td></tr>"))
            .collect::<String>();
        // Three tables at the results depth; the data lives in the third.
        format!(
            "<html><body><table><tbody><tr><td><table><tbody><tr><td>\
             <table><tbody><tr><td>nav</td></tr></tbody></table>\
             <table><tbody><tr><td>header</td></tr></tbody></table>\
             <table><tbody>{rows}</tbody></table>\
             </td></tr></tbody></table></td></tr></tbody></table></body></html>"
        )
    }

    #[test]
    fn extract_rows_reads_highlighted_cells_from_the_third_table() {
        let html = listing_page(&["1", "Bali", " 80351"]);
        let rows = extract_rows(&html).expect("rows");
        assert_eq!(rows, vec!["1", "Bali", " 80351"]);
    }

    #[test]
    fn extract_rows_fails_when_the_results_table_is_absent() {
        let err = extract_rows("<html><body><p>maintenance</p></body></html>")
            .expect_err("no tables");
        assert!(matches!(err, SourceError::MissingResultsTable));
    }

    fn village_group(n: usize) -> Vec<String> {
        vec![
            format!("{n}"),
            format!("Kode Pos 1{n:04}"),
            format!("Village {n}"),
            "Gambir".to_string(),
            "00".to_string(),
            " Jakarta".to_string(),
        ]
    }

    #[tokio::test]
    async fn loader_reassembles_records_across_page_boundaries() {
        let dir = tempdir().expect("tempdir");
        let store = PageStore::new(dir.path());

        // 250 records staged as pages worth 100/100/50 entities.
        let mut n = 0usize;
        for (page, count) in [(0usize, 100usize), (1, 100), (2, 50)] {
            let mut rows = Vec::new();
            for _ in 0..count {
                rows.extend(village_group(n));
                n += 1;
            }
            store
                .write_page(&PageKey::new(EntityKind::Village, page), &rows)
                .await
                .expect("stage page");
        }

        let records = load_village_records(&store, 3).await.expect("load");
        assert_eq!(records.len(), 250);
        assert_eq!(records[0].village, "Village 0");
        assert_eq!(records[0].zip_code, "10000");
        assert_eq!(records[249].village, "Village 249");
        assert_eq!(records[249].regency, RegencyKey::new("00", " Jakarta"));
    }

    #[tokio::test]
    async fn misaligned_page_is_fatal_and_names_the_page() {
        let dir = tempdir().expect("tempdir");
        let store = PageStore::new(dir.path());

        let mut rows = village_group(0);
        rows.extend(village_group(1));
        rows.pop(); // drop one field to break alignment
        store
            .write_page(&PageKey::new(EntityKind::Village, 0), &rows)
            .await
            .expect("stage page");

        let err = load_village_records(&store, 1).await.expect_err("misaligned");
        match err {
            LoadError::Alignment { kind, page, rows, fields_per_record } => {
                assert_eq!(kind, EntityKind::Village);
                assert_eq!(page, 0);
                assert_eq!(rows, 11);
                assert_eq!(fields_per_record, 6);
            }
            other => panic!("expected alignment fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn zip_line_without_a_third_token_is_fatal() {
        let dir = tempdir().expect("tempdir");
        let store = PageStore::new(dir.path());

        let mut rows = village_group(0);
        rows[1] = "Kode 10110".to_string();
        store
            .write_page(&PageKey::new(EntityKind::Village, 0), &rows)
            .await
            .expect("stage page");

        let err = load_village_records(&store, 1).await.expect_err("bad zip line");
        assert!(matches!(err, LoadError::MalformedZipLine { .. }));
    }

    #[tokio::test]
    async fn regency_records_carry_the_composite_key() {
        let dir = tempdir().expect("tempdir");
        let store = PageStore::new(dir.path());

        let rows: Vec<String> = vec![
            "1", "Jawa Barat", "Kab.", "Bandung", "40111", "x", "y",
        ]
        .into_iter()
        .map(str::to_string)
        .collect();
        store
            .write_page(&PageKey::with_parent(EntityKind::Regency, 0, "Jawa Barat"), &rows)
            .await
            .expect("stage page");

        let records = load_regency_records(&store, "Jawa Barat", 1)
            .await
            .expect("load");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].province, "Jawa Barat");
        assert_eq!(records[0].regency.lookup_key(), "Kab. Bandung");
    }
}

//! Core domain model and record layout tables for the kodepos harvester.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "kodepos-core";

/// The three entity types the remote source paginates independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Province,
    Regency,
    Village,
}

impl EntityKind {
    /// Staging directory name for this entity type.
    pub fn dir_name(self) -> &'static str {
        match self {
            EntityKind::Province => "province",
            EntityKind::Regency => "regency",
            EntityKind::Village => "village",
        }
    }

    pub fn fields_per_record(self) -> usize {
        match self {
            EntityKind::Province => PROVINCE_LAYOUT.fields_per_record,
            EntityKind::Regency => REGENCY_LAYOUT.fields_per_record,
            EntityKind::Village => VILLAGE_LAYOUT.fields_per_record,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Positional layout of one province record within a staged page.
///
/// The source renders one entity as a fixed-size run of table cells, so a
/// staged page is sliced into groups of `fields_per_record` rows and each
/// field is read at a fixed offset inside its group. These tables are the
/// single place the source format is encoded; a markup change on the
/// source side only touches the constants below.
#[derive(Debug, Clone, Copy)]
pub struct ProvinceLayout {
    pub fields_per_record: usize,
    pub name: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct RegencyLayout {
    pub fields_per_record: usize,
    pub province: usize,
    pub prefix: usize,
    pub name: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct VillageLayout {
    pub fields_per_record: usize,
    /// Row whose third whitespace-delimited token is the postal code.
    pub zip_line: usize,
    pub village: usize,
    pub district: usize,
    pub regency_prefix: usize,
    pub regency_name: usize,
}

pub const PROVINCE_LAYOUT: ProvinceLayout = ProvinceLayout {
    fields_per_record: 10,
    name: 1,
};

pub const REGENCY_LAYOUT: RegencyLayout = RegencyLayout {
    fields_per_record: 7,
    province: 1,
    prefix: 2,
    name: 3,
};

pub const VILLAGE_LAYOUT: VillageLayout = VillageLayout {
    fields_per_record: 6,
    zip_line: 1,
    village: 2,
    district: 3,
    regency_prefix: 4,
    regency_name: 5,
};

/// Composite regency identity as it appears in source text.
///
/// Regency names alone are not unique across the source ("Kota X" vs
/// "Kab. X"), so the prefix is part of the key everywhere a regency is
/// looked up.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegencyKey {
    pub prefix: String,
    pub name: String,
}

impl RegencyKey {
    pub fn new(prefix: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            name: name.into(),
        }
    }

    /// The flattened form used as a lookup key and as the regency's
    /// display name in the output tree.
    pub fn lookup_key(&self) -> String {
        format!("{} {}", self.prefix, self.name)
    }
}

impl fmt::Display for RegencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.prefix, self.name)
    }
}

/// One parsed province row group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvinceRecord {
    pub name: String,
}

/// One parsed regency row group; carries its owning province's name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegencyRecord {
    pub province: String,
    pub regency: RegencyKey,
}

/// One parsed village row group, the unit the aggregation engine consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VillageRecord {
    pub zip_code: String,
    pub village: String,
    pub district: String,
    pub regency: RegencyKey,
}

/// Province node of the output tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Province {
    pub id: u32,
    pub name: String,
    pub regencies: Vec<Regency>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Regency {
    pub id: u32,
    pub province_id: u32,
    pub name: String,
    pub districts: Vec<District>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct District {
    pub id: u32,
    pub regency_id: u32,
    pub province_id: u32,
    pub name: String,
    pub villages: Vec<Village>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Village {
    pub id: u32,
    pub district_id: u32,
    pub regency_id: u32,
    pub province_id: u32,
    pub name: String,
    pub zip_code: String,
}

/// Flat projection entries, keyed by the parent's ID in the output maps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvinceItem {
    pub id: u32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegencyItem {
    pub id: u32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistrictItem {
    pub id: u32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VillageItem {
    pub id: u32,
    pub name: String,
    pub zip_code: String,
}

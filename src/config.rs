use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::PathBuf;

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::Cache;
use crate::domain::EntityKind;
use crate::error::PopulateError;
use crate::table::{self, CsvSource, EmptyEquivalents, Row};

pub const APP_NAME: &str = "populate-scamplers";
pub const DEFAULT_MAX_CONCURRENCY: usize = 16;
pub const DEFAULT_ERROR_DIR: &str = ".errors";

/// The spreadsheet exports the migration reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CsvFile {
    Institutions,
    People,
    Labs,
    Projects,
    Specimens,
    SpecimenMeasurements,
    Suspensions,
    SuspensionPools,
    Gems,
    GemsSuspensions,
    Cdna,
    Libraries,
    SequencingSubmissions,
}

impl CsvFile {
    /// Key used in `file_renaming`, `csv_field_renamings`, `head_rows` and
    /// `empty_equivalents`.
    pub fn key(&self) -> &'static str {
        match self {
            CsvFile::Institutions => "institutions",
            CsvFile::People => "people",
            CsvFile::Labs => "labs",
            CsvFile::Projects => "projects",
            CsvFile::Specimens => "specimens",
            CsvFile::SpecimenMeasurements => "specimen_measurements",
            CsvFile::Suspensions => "suspensions",
            CsvFile::SuspensionPools => "suspension_pools",
            CsvFile::Gems => "gems",
            CsvFile::GemsSuspensions => "gems_suspensions",
            CsvFile::Cdna => "cdna",
            CsvFile::Libraries => "libraries",
            CsvFile::SequencingSubmissions => "sequencing_submissions",
        }
    }

    pub fn filename(&self) -> String {
        format!("{}.csv", self.key())
    }
}

/// The TOML settings file. Every key is optional here; required ones are
/// checked once command-line overrides have been applied.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub api_base_url: Option<String>,
    pub api_key: Option<String>,
    pub accept_invalid_certificates: bool,
    pub cache_dir: Option<Utf8PathBuf>,
    pub error_dir: Option<Utf8PathBuf>,
    pub skip: Vec<EntityKind>,
    pub max_concurrency: Option<usize>,
    /// `institutions.csv` → actual file name.
    pub file_renaming: HashMap<String, String>,
    /// Per CSV key: header → field name.
    pub csv_field_renamings: HashMap<String, HashMap<String, String>>,
    /// Per CSV key: lines above the header row.
    pub head_rows: HashMap<String, usize>,
    /// Per CSV key: field → placeholder values that mark a row as empty.
    pub empty_equivalents: HashMap<String, HashMap<String, Vec<String>>>,
    /// Institution name → email domain.
    pub institution_domains: Option<BTreeMap<String, String>>,
    /// 10x assay name → scamplers assay ID.
    pub assays: Option<BTreeMap<String, Uuid>>,
}

/// Command-line values that win over the settings file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub csv_dir: PathBuf,
    pub dataset_dirs: Vec<Utf8PathBuf>,
    pub api_base_url: Option<String>,
    pub api_key: Option<String>,
    pub accept_invalid_certificates: bool,
    pub cache_dir: Option<Utf8PathBuf>,
    pub error_dir: Option<Utf8PathBuf>,
    pub skip: Vec<EntityKind>,
    pub max_concurrency: Option<usize>,
}

/// Where the inputs live and how to read them.
#[derive(Debug, Clone, Default)]
pub struct Sources {
    pub csv_dir: PathBuf,
    pub dataset_dirs: Vec<Utf8PathBuf>,
    file_renaming: HashMap<String, String>,
    field_renamings: HashMap<String, HashMap<String, String>>,
    head_rows: HashMap<String, usize>,
    empty_equivalents: HashMap<String, HashMap<String, Vec<String>>>,
}

impl Sources {
    pub fn new(csv_dir: impl Into<PathBuf>) -> Self {
        Self {
            csv_dir: csv_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_dataset_dirs(mut self, dataset_dirs: Vec<Utf8PathBuf>) -> Self {
        self.dataset_dirs = dataset_dirs;
        self
    }

    pub fn with_empty_equivalents(
        mut self,
        file: CsvFile,
        values: HashMap<String, Vec<String>>,
    ) -> Self {
        self.empty_equivalents.insert(file.key().to_string(), values);
        self
    }

    pub fn source(&self, file: CsvFile) -> CsvSource {
        CsvSource {
            path: table::csv_path(&self.csv_dir, &file.filename(), &self.file_renaming),
            head_row: self.head_rows.get(file.key()).copied().unwrap_or_default(),
            field_renaming: self
                .field_renamings
                .get(file.key())
                .cloned()
                .unwrap_or_default(),
        }
    }

    pub fn read(&self, file: CsvFile) -> Result<Vec<Row>, PopulateError> {
        table::read_csv(&self.source(file))
    }

    /// Like [`Sources::read`], but a missing export reads as no rows.
    pub fn read_optional(&self, file: CsvFile) -> Result<Vec<Row>, PopulateError> {
        table::read_optional_csv(&self.source(file))
    }

    pub fn empty_equivalents(&self, file: CsvFile) -> EmptyEquivalents {
        EmptyEquivalents::new(
            self.empty_equivalents
                .get(file.key())
                .cloned()
                .unwrap_or_default(),
        )
    }
}

/// Reference tables the API cannot answer.
#[derive(Debug, Clone)]
pub struct LookupTables {
    pub institution_domains: BTreeMap<String, String>,
    pub assays: BTreeMap<String, Uuid>,
}

impl Default for LookupTables {
    fn default() -> Self {
        Self {
            institution_domains: default_institution_domains(),
            assays: default_assays(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub api_base_url: String,
    pub api_key: String,
    pub accept_invalid_certificates: bool,
    pub cache_dir: Utf8PathBuf,
    pub error_dir: Utf8PathBuf,
    pub skip: BTreeSet<EntityKind>,
    pub max_concurrency: usize,
    pub sources: Sources,
    pub tables: LookupTables,
}

impl ResolvedConfig {
    pub fn cache(&self) -> Cache {
        Cache::new(self.cache_dir.clone())
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn default_path() -> Result<Utf8PathBuf, PopulateError> {
        BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(
                    dirs.home_dir()
                        .join(".config")
                        .join(APP_NAME)
                        .join("settings.toml"),
                )
                .ok()
            })
            .ok_or_else(|| {
                PopulateError::Filesystem("unable to resolve settings path".to_string())
            })
    }

    /// An explicit path must exist. Without one, a missing default file
    /// means "all settings come from the command line".
    pub fn load(path: Option<&Utf8Path>) -> Result<Settings, PopulateError> {
        let config_path = match path {
            Some(path) => path.to_owned(),
            None => Self::default_path()?,
        };

        if !config_path.as_std_path().exists() {
            if path.is_some() {
                return Err(PopulateError::MissingConfig(config_path.into_std_path_buf()));
            }
            tracing::debug!(path = %config_path, "no settings file, using defaults");
            return Ok(Settings::default());
        }

        let content = fs::read_to_string(config_path.as_std_path())
            .map_err(|_| PopulateError::ConfigRead(config_path.clone().into_std_path_buf()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Settings, PopulateError> {
        toml::from_str(content).map_err(|err| PopulateError::ConfigParse(err.to_string()))
    }

    pub fn resolve(
        settings: Settings,
        overrides: Overrides,
    ) -> Result<ResolvedConfig, PopulateError> {
        let api_base_url = overrides
            .api_base_url
            .or(settings.api_base_url)
            .filter(|value| !value.trim().is_empty())
            .ok_or(PopulateError::MissingSetting("api_base_url"))?;
        let api_key = overrides
            .api_key
            .or(settings.api_key)
            .filter(|value| !value.trim().is_empty())
            .ok_or(PopulateError::MissingSetting("api_key"))?;

        let cache_dir = match overrides.cache_dir.or(settings.cache_dir) {
            Some(dir) => dir,
            None => Cache::default_root()?,
        };
        let error_dir = overrides
            .error_dir
            .or(settings.error_dir)
            .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_ERROR_DIR));

        let max_concurrency = overrides
            .max_concurrency
            .or(settings.max_concurrency)
            .unwrap_or(DEFAULT_MAX_CONCURRENCY)
            .max(1);

        let skip = settings
            .skip
            .into_iter()
            .chain(overrides.skip)
            .collect::<BTreeSet<_>>();

        let sources = Sources {
            csv_dir: overrides.csv_dir,
            dataset_dirs: overrides.dataset_dirs,
            file_renaming: settings.file_renaming,
            field_renamings: settings.csv_field_renamings,
            head_rows: settings.head_rows,
            empty_equivalents: settings.empty_equivalents,
        };

        let tables = LookupTables {
            institution_domains: settings
                .institution_domains
                .unwrap_or_else(default_institution_domains),
            assays: settings.assays.unwrap_or_else(default_assays),
        };

        Ok(ResolvedConfig {
            api_base_url,
            api_key,
            accept_invalid_certificates: overrides.accept_invalid_certificates
                || settings.accept_invalid_certificates,
            cache_dir,
            error_dir,
            skip,
            max_concurrency,
            sources,
            tables,
        })
    }
}

pub fn default_institution_domains() -> BTreeMap<String, String> {
    [
        ("Banner MD Anderson Cancer Center", "mdanderson.org"),
        ("Cold Spring Harbor Laboratory", "cshl.edu"),
        ("Houston Methodist", "houstonmethodist.org"),
        ("Jackson Laboratory", "jax.org"),
        ("University of Connecticut", "uconn.edu"),
        ("University of Connecticut Health Center", "uchc.edu"),
        ("Connecticut Children’s Research Institute", "connecticutchildrens.org"),
        ("National Institutes of Health", "nih.gov"),
        ("Yale University", "yale.edu"),
    ]
    .into_iter()
    .map(|(name, domain)| (name.to_string(), domain.to_string()))
    .collect()
}

/// scamplers has no assay listing, so the known 10x assays are pinned here.
pub fn default_assays() -> BTreeMap<String, Uuid> {
    [
        (
            "Multiplex Flex Gene Expression v1 (GEM-X)",
            Uuid::from_u128(0x01993aaa_318e_7768_a7ed_bc6ec6d6f0eb),
        ),
        (
            "Multiplex Flex Gene Expression v1 (Next GEM)",
            Uuid::from_u128(0x01993aaa_3196_7c29_8bfb_11dba37c66f2),
        ),
        (
            "Single Cell 3' + Cell Surface Protein OCM v4",
            Uuid::from_u128(0x01993aaa_31a3_7ca5_9098_80f67a7f8406),
        ),
        (
            "Single Cell 3' Gene Expression + Cell Surface Protein v4",
            Uuid::from_u128(0x01993aaa_319f_7799_aa80_adf9c0804c79),
        ),
        (
            "Single Cell 3' Gene Expression OCM v4",
            Uuid::from_u128(0x01993aaa_31ab_73d9_a163_2ba45df2d95f),
        ),
        (
            "Single Cell 3' Gene Expression v4",
            Uuid::from_u128(0x01993aaa_31a7_76d7_94a1_dcc5c488cf68),
        ),
        (
            "Single Cell 5' Gene Expression +  V(D)J OCM v3",
            Uuid::from_u128(0x01993aaa_31bd_7bd2_bed3_e599c0b866b9),
        ),
        (
            "Single Cell 5' Gene Expression +  V(D)J v3",
            Uuid::from_u128(0x01993aaa_31c4_71f5_9f2c_cd88e4642522),
        ),
        (
            "Single Cell 5' Gene Expression OCM v3",
            Uuid::from_u128(0x01993aaa_31b1_763c_9e58_5e83c6a03e39),
        ),
        (
            "Single Cell 5' Gene Expression v3",
            Uuid::from_u128(0x01993aaa_31b4_7426_b0b2_4421e2828ba7),
        ),
        (
            "Single Cell 5' Gene Expression + CRISPR Screening v3",
            Uuid::from_u128(0x01993aaa_31ae_7451_ba30_07c3911db83d),
        ),
        (
            "Single Cell ATAC v2",
            Uuid::from_u128(0x01993aaa_3183_7cc2_9710_47cbae4ece53),
        ),
        (
            "Single Cell Multiome ATAC + Gene Expression v1",
            Uuid::from_u128(0x01993aaa_318a_7536_aaca_8ce12682b037),
        ),
        (
            "Singleplex Flex Gene Expression v1 (GEM-X)",
            Uuid::from_u128(0x01993aaa_3192_7174_b1fd_18e0d7bc7ff0),
        ),
        (
            "Singleplex Flex Gene Expression v1 (Next GEM)",
            Uuid::from_u128(0x01993aaa_319b_723d_ba96_fbc2877e62f4),
        ),
    ]
    .into_iter()
    .map(|(name, id)| (name.to_string(), id))
    .collect()
}

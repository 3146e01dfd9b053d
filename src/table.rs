//! Plain-text tables: cube lists naming a set of exposures, and WCS
//! correction tables.
use std::fmt::Display;
use std::path::{Path, PathBuf};

use crate::{Header, IfuError, Result};

/// A set of exposures to process together.
///
/// ```text
/// INPUT_DIRECTORY = /data/night1/   # where to look
/// SEARCH_DEPTH = 2
/// OUTPUT_DIRECTORY = /data/out/
/// >kb180101_00042
/// >kb180101_00043
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct CubeList {
    pub input_directory: PathBuf,
    pub search_depth: usize,
    pub output_directory: PathBuf,
    /// exposure identifiers, matched as substrings of file names
    pub ids: Vec<String>,
}

impl Default for CubeList {
    fn default() -> Self {
        Self {
            input_directory: PathBuf::from("./"),
            search_depth: 3,
            output_directory: PathBuf::from("./"),
            ids: vec![],
        }
    }
}

fn parse_depth(value: &str) -> Result<usize> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|_| IfuError::Table(format!("could not parse SEARCH_DEPTH to int ({})", value)))
}

impl CubeList {
    pub fn parse(contents: &str) -> Result<Self> {
        let mut list = Self::default();
        for line in contents.lines() {
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(id) = line.strip_prefix('>') {
                list.ids.push(id.trim().to_string());
                continue;
            }
            let line = line.split('#').next().unwrap_or("").replace(' ', "");
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key.to_ascii_uppercase().as_str() {
                "INPUT_DIRECTORY" => list.input_directory = PathBuf::from(value),
                "OUTPUT_DIRECTORY" => list.output_directory = PathBuf::from(value),
                "SEARCH_DEPTH" => list.search_depth = parse_depth(value)?,
                _ => {
                    return Err(IfuError::Table(format!(
                        "unrecognized cube list field: {}",
                        key
                    )))
                }
            }
        }
        for dir in [&list.input_directory, &list.output_directory] {
            if !dir.is_dir() {
                log::warn!("{} is not a directory", dir.display());
            }
        }
        Ok(list)
    }

    pub fn from_file<P: AsRef<Path>>(filename: P) -> Result<Self> {
        Self::parse(&std::fs::read_to_string(filename)?)
    }

    /// Files ending in `cube_type` (e.g. `icubes.fits`) whose names contain
    /// one of the ids, searched up to `search_depth` directories below the
    /// input directory. Sorted.
    pub fn find_files(&self, cube_type: &str) -> Result<Vec<PathBuf>> {
        find_files(&self.ids, &self.input_directory, cube_type, self.search_depth)
    }
}

/// Search `dir` and up to `depth` levels of subdirectories for files ending
/// in `cube_type` whose names contain one of `ids`.
pub fn find_files<P: AsRef<Path>>(
    ids: &[String],
    dir: P,
    cube_type: &str,
    depth: usize,
) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(IfuError::IOError(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("data directory {} does not exist", dir.display()),
        )));
    }
    let mut files = vec![];
    let mut base = glob::Pattern::escape(&dir.to_string_lossy());
    for _ in 0..=depth {
        let pattern = format!("{}/*{}", base, glob::Pattern::escape(cube_type));
        for path in glob::glob(&pattern)? {
            let path = path?;
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if ids.iter().any(|id| name.contains(id.as_str())) {
                files.push(path);
            }
        }
        base.push_str("/*");
    }
    files.sort();
    files.dedup();
    for id in ids {
        let found = files.iter().any(|f| {
            f.file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.contains(id.as_str()))
        });
        if !found {
            log::warn!("no file with id {} and type {} found", id, cube_type);
        }
    }
    Ok(files)
}

/// One row of a WCS correction table.
#[derive(Clone, Debug, PartialEq)]
pub struct WcsCorrection {
    pub id: String,
    pub crval: [f64; 3],
    pub crpix: [f64; 3],
}

impl WcsCorrection {
    /// Write the corrected reference values into `header`.
    ///
    /// Each axis is only updated when its `CRVAL` is physically valid (RA in
    /// 0-360, Dec in -90..90, wavelength positive); invalid axes are skipped
    /// with a warning. Returns which axes were updated.
    pub fn apply(&self, header: &mut Header) -> [bool; 3] {
        let valid = [
            (0.0..=360.0).contains(&self.crval[0]),
            (-90.0..=90.0).contains(&self.crval[1]),
            self.crval[2] > 0.0,
        ];
        for (i, ok) in valid.iter().enumerate() {
            if *ok {
                header.set(&format!("CRVAL{}", i + 1), self.crval[i]);
                header.set(&format!("CRPIX{}", i + 1), self.crpix[i]);
            } else {
                log::warn!(
                    "{}: invalid CRVAL{} {}, axis left unchanged",
                    self.id,
                    i + 1,
                    self.crval[i]
                );
            }
        }
        valid
    }
}

impl TryFrom<&str> for WcsCorrection {
    type Error = IfuError;

    /// parse a `>id crval1 crval2 crval3 crpix1 crpix2 crpix3` row
    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        let s = s.trim();
        let s = s.strip_prefix('>').ok_or(IfuError::Table(format!(
            "correction row must start with '>': {}",
            s
        )))?;
        let mut split = s.split_whitespace();
        let id = split
            .next()
            .ok_or(IfuError::Table("missing id in correction row".to_string()))?
            .to_string();
        let mut values = [0.0; 6];
        for (i, v) in values.iter_mut().enumerate() {
            let a = split.next().ok_or(IfuError::Table(format!(
                "correction row for {} has {} values, expected 6",
                id, i
            )))?;
            *v = a.parse::<f64>().map_err(|_| {
                IfuError::Table(format!("failed to parse value {} for {}", a, id))
            })?;
        }
        Ok(Self {
            id,
            crval: [values[0], values[1], values[2]],
            crpix: [values[3], values[4], values[5]],
        })
    }
}

impl Display for WcsCorrection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            ">{:>19} {:>15.7} {:>15.7} {:>10.3} {:>10.1} {:>10.1} {:>10.1}",
            self.id,
            self.crval[0],
            self.crval[1],
            self.crval[2],
            self.crpix[0],
            self.crpix[1],
            self.crpix[2]
        )
    }
}

/// Per-exposure WCS corrections and where to find the exposures.
#[derive(Clone, Debug, PartialEq)]
pub struct WcsCorrectionTable {
    pub input_directory: PathBuf,
    pub search_depth: usize,
    pub rows: Vec<WcsCorrection>,
}

impl WcsCorrectionTable {
    pub fn parse(contents: &str) -> Result<Self> {
        let mut table = Self {
            input_directory: PathBuf::from("."),
            search_depth: 3,
            rows: vec![],
        };
        for line in contents.lines() {
            let line = line.trim();
            if line.starts_with('>') {
                table.rows.push(WcsCorrection::try_from(line)?);
            } else if let Some((key, value)) = line.split_once('=') {
                match key.trim() {
                    "INPUT_DIRECTORY" => table.input_directory = PathBuf::from(value.trim()),
                    "SEARCH_DEPTH" => table.search_depth = parse_depth(value)?,
                    _ => (),
                }
            }
        }
        Ok(table)
    }

    pub fn from_file<P: AsRef<Path>>(filename: P) -> Result<Self> {
        Self::parse(&std::fs::read_to_string(filename)?)
    }

    pub fn to_file<P: AsRef<Path>>(&self, filename: P) -> Result<()> {
        std::fs::write(filename, self.to_string())?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&WcsCorrection> {
        self.rows.iter().find(|row| row.id == id)
    }
}

impl Display for WcsCorrectionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "INPUT_DIRECTORY={}", self.input_directory.display())?;
        writeln!(f, "SEARCH_DEPTH={}", self.search_depth)?;
        writeln!(
            f,
            "#{:>19} {:>15} {:>15} {:>10} {:>10} {:>10} {:>10}",
            "ID", "CRVAL1", "CRVAL2", "CRVAL3", "CRPIX1", "CRPIX2", "CRPIX3"
        )?;
        for row in &self.rows {
            writeln!(f, "{}", row)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cube_list_fields() {
        let list = CubeList::parse(
            "# my targets\n\
             INPUT_DIRECTORY = /tmp/in/ # raw\n\
             SEARCH_DEPTH = 1\n\
             \n\
             >kb180101_00042\n\
             >kb180101_00043\n",
        )
        .unwrap();
        assert_eq!(list.input_directory, PathBuf::from("/tmp/in/"));
        assert_eq!(list.search_depth, 1);
        assert_eq!(list.output_directory, PathBuf::from("./"));
        assert_eq!(list.ids, vec!["kb180101_00042", "kb180101_00043"]);
    }

    #[test]
    fn cube_list_errors() {
        assert!(matches!(
            CubeList::parse("SEARCH_DEPTH = deep\n"),
            Err(IfuError::Table(_))
        ));
        assert!(matches!(
            CubeList::parse("TARGET = m51\n"),
            Err(IfuError::Table(_))
        ));
    }

    #[test]
    fn finds_files_within_depth() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        for path in [
            dir.path().join("kb1_icubes.fits"),
            dir.path().join("kb1_vcubes.fits"),
            dir.path().join("a").join("kb2_icubes.fits"),
            nested.join("kb3_icubes.fits"),
            dir.path().join("other_icubes.fits"),
        ] {
            std::fs::write(path, b"").unwrap();
        }
        let ids = vec!["kb1".to_string(), "kb2".to_string(), "kb3".to_string()];
        let files = find_files(&ids, dir.path(), "icubes.fits", 1).unwrap();
        assert_eq!(
            files,
            vec![
                dir.path().join("a").join("kb2_icubes.fits"),
                dir.path().join("kb1_icubes.fits"),
            ]
        );
        assert_eq!(find_files(&ids, dir.path(), "icubes.fits", 2).unwrap().len(), 3);
    }

    #[test]
    fn correction_row_format() {
        let row = WcsCorrection::try_from(">kb1  150.1  2.2  4000.5  10.0  20.0  1.5").unwrap();
        assert_eq!(row.id, "kb1");
        assert_eq!(row.crval, [150.1, 2.2, 4000.5]);
        assert_eq!(row.crpix, [10.0, 20.0, 1.5]);
        let text = row.to_string();
        assert!(text.starts_with(">                kb1     150.1000000       2.2000000"));
        assert_eq!(WcsCorrection::try_from(text.as_str()).unwrap(), row);
        assert!(matches!(
            WcsCorrection::try_from(">kb1 1 2 3"),
            Err(IfuError::Table(_))
        ));
        assert!(matches!(
            WcsCorrection::try_from(">kb1 1 2 3 x 5 6"),
            Err(IfuError::Table(_))
        ));
    }

    #[test]
    fn table_parse_and_apply() {
        let table = WcsCorrectionTable::parse(
            "INPUT_DIRECTORY=/data/\n\
             SEARCH_DEPTH=2\n\
             #     ID CRVAL1 CRVAL2 CRVAL3 CRPIX1 CRPIX2 CRPIX3\n\
             >kb1 150.0 2.0 4000.0 10.0 20.0 1.0\n\
             >kb2 400.0 -95.0 4001.0 11.0 21.0 2.0\n",
        )
        .unwrap();
        assert_eq!(table.input_directory, PathBuf::from("/data/"));
        assert_eq!(table.search_depth, 2);
        assert_eq!(table.rows.len(), 2);

        let mut hdr = Header::new();
        hdr.set("CRVAL1", 1.0);
        hdr.set("CRPIX1", 1.0);
        let applied = table.get("kb2").unwrap().apply(&mut hdr);
        assert_eq!(applied, [false, false, true]);
        assert_eq!(hdr.float("CRVAL1").unwrap(), 1.0);
        assert_eq!(hdr.float("CRPIX3").unwrap(), 2.0);

        let reparsed = WcsCorrectionTable::parse(&table.to_string()).unwrap();
        assert_eq!(reparsed, table);
    }
}

//! Engine backed by the `orcaslicer-cli` executable.
//!
//! Each native call is one blocking process invocation:
//!
//! | Call | Command line |
//! |---|---|
//! | version | `version` |
//! | inspect | `info --input <model>` |
//! | preset check | `list-profiles --type <kind>` |
//! | slice | `slice --input <model> --output <gcode> --plate <n> [--printer ..] [--set k=v,..] [--dry-run]` |
//!
//! The executable exits with the engine's own error code, which is passed
//! through unchanged. It looks for its profiles under `OrcaSlicer/resources`
//! relative to its working directory, so a resources path is honored by
//! running the executable from that path's grandparent.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tracing::{debug, info, warn};

use crate::model::{ModelInfo, SliceRequest};
use crate::native::{codes, ModelHandle, NativeEngine, NativeError, NativeResult, PresetKind};

/// Executable name used by [`CliEngine::default`].
pub const DEFAULT_PROGRAM: &str = "orcaslicer-cli";

const RESOURCES_SUFFIX: [&str; 2] = ["OrcaSlicer", "resources"];

/// Profiles reported by `list-profiles` for one kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileListing {
    /// Listed profile names.
    pub names: Vec<String>,
    /// The executable elided part of the list.
    pub truncated: bool,
}

impl ProfileListing {
    fn admits(&self, name: &str) -> bool {
        self.truncated || self.names.iter().any(|n| n == name)
    }
}

/// [`NativeEngine`] that shells out to the slicer command line.
///
/// Printer, filament and process presets loaded through
/// [`NativeEngine::load_preset`] become the profiles used by slices that do
/// not name their own. In strict mode a slice may only name profiles loaded
/// that way. Vendor presets are accepted and ignored: the executable loads
/// vendor bundles on its own and has no option to select them.
#[derive(Debug)]
pub struct CliEngine {
    program: PathBuf,
    working_dir: Option<PathBuf>,
    verbose: bool,
    strict: bool,
    listings: BTreeMap<PresetKind, ProfileListing>,
    loaded: BTreeSet<(PresetKind, String)>,
    selected: BTreeMap<PresetKind, String>,
    next_model: u64,
}

impl Default for CliEngine {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRAM)
    }
}

impl CliEngine {
    /// Engine running `program`, resolved through `PATH` if not absolute.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            working_dir: None,
            verbose: false,
            strict: false,
            listings: BTreeMap::new(),
            loaded: BTreeSet::new(),
            selected: BTreeMap::new(),
            next_model: 0,
        }
    }

    /// Profile selected for `kind`, if any.
    pub fn selected(&self, kind: PresetKind) -> Option<&str> {
        self.selected.get(&kind).map(String::as_str)
    }

    fn run(&self, args: &[OsString]) -> NativeResult<Output> {
        let mut command = Command::new(&self.program);
        if self.verbose {
            command.arg("--verbose");
        }
        command.args(args);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        debug!(program = %self.program.display(), ?args, "running slicer executable");

        command.output().map_err(|e| {
            NativeError::new(
                codes::INITIALIZATION,
                format!("cannot run {}: {e}", self.program.display()),
            )
        })
    }

    fn run_checked(&self, args: &[OsString]) -> NativeResult<String> {
        let output = self.run(args)?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = output.status.code().unwrap_or(codes::INTERNAL);
        Err(NativeError::new(code, failure_message(&stderr, &stdout, code)))
    }

    fn listing(&mut self, kind: PresetKind) -> NativeResult<&ProfileListing> {
        if !self.listings.contains_key(&kind) {
            let stdout = self.run_checked(&[
                "list-profiles".into(),
                "--type".into(),
                kind.to_string().into(),
            ])?;
            let listing = parse_profiles(&stdout, kind);
            debug!(%kind, count = listing.names.len(), truncated = listing.truncated, "profiles listed");
            self.listings.insert(kind, listing);
        }
        self.listings
            .get(&kind)
            .ok_or_else(|| NativeError::malformed(format!("no {kind} profile listing")))
    }
}

impl NativeEngine for CliEngine {
    fn version(&self) -> String {
        match self.run_checked(&["version".into()]) {
            Ok(stdout) => stdout
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .unwrap_or("unknown")
                .to_string(),
            Err(err) => {
                warn!(code = err.code, error = %err.message, "version query failed");
                "unknown".to_string()
            }
        }
    }

    fn initialize(
        &mut self,
        resources_path: Option<&Path>,
        verbose: bool,
        strict: bool,
    ) -> NativeResult<()> {
        self.working_dir = resources_path.map(working_dir_for).transpose()?;
        self.verbose = verbose;
        self.strict = strict;

        if let Err(err) = self.run_checked(&["version".into()]) {
            self.working_dir = None;
            return Err(NativeError::new(codes::INITIALIZATION, err.message));
        }
        info!(
            program = %self.program.display(),
            working_dir = ?self.working_dir,
            "slicer executable ready"
        );
        Ok(())
    }

    fn shutdown(&mut self) {
        self.working_dir = None;
        self.verbose = false;
        self.strict = false;
        self.listings.clear();
        self.loaded.clear();
        self.selected.clear();
    }

    fn load_preset(&mut self, kind: PresetKind, name: &str) -> NativeResult<()> {
        if kind == PresetKind::Vendor {
            debug!(vendor = name, "vendor bundles are loaded by the executable");
            return Ok(());
        }
        if !self.listing(kind)?.admits(name) {
            return Err(NativeError::new(
                codes::CONFIGURATION,
                format!("{kind} profile not found: {name}"),
            ));
        }
        self.loaded.insert((kind, name.to_string()));
        self.selected.insert(kind, name.to_string());
        Ok(())
    }

    fn load_model(&mut self, path: &Path) -> NativeResult<ModelHandle> {
        if !path.is_file() {
            return Err(NativeError::new(
                codes::FILE_NOT_FOUND,
                format!("file not found: {}", path.display()),
            ));
        }
        self.next_model += 1;
        Ok(ModelHandle::new(self.next_model, path))
    }

    fn inspect(&mut self, model: &ModelHandle) -> NativeResult<ModelInfo> {
        let args = ["info".into(), "--input".into(), model.path().as_os_str().to_owned()];
        let output = self.run(&args)?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        // An invalid model still produces a report, with a non-zero exit.
        match (output.status.code(), parse_info(&stdout)) {
            (Some(0), report) => report.map(|r| r.info),
            (Some(code), Ok(report)) if !report.info.is_valid => {
                warn!(code, errors = ?report.errors, "model reported invalid");
                Ok(report.info)
            }
            (code, _) => {
                let code = code.unwrap_or(codes::INTERNAL);
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(NativeError::new(code, failure_message(&stderr, &stdout, code)))
            }
        }
    }

    fn slice_to_gcode(
        &mut self,
        _model: &ModelHandle,
        request: &SliceRequest,
    ) -> NativeResult<PathBuf> {
        if self.strict {
            check_loaded(request, &self.loaded)?;
        }
        let args = slice_args(request, &self.selected)?;
        self.run_checked(&args)?;
        Ok(request.output.clone())
    }
}

/// Parsed `info` report.
#[derive(Debug, Clone, PartialEq)]
pub struct InfoReport {
    /// Model description.
    pub info: ModelInfo,
    /// Problems listed under `Errors:`.
    pub errors: Vec<String>,
    /// Problems listed under `Warnings:`.
    pub warnings: Vec<String>,
}

/// Parse the report printed by `info`.
///
/// ```text
/// Model Information:
///   File: /models/cube.3mf
///   Valid: Yes
///   Objects: 1
///   Triangles: 12
///   Volume: 1000 mm³
///   Bounding Box: [0, 0, 0] - [10, 10, 10]
/// ```
pub fn parse_info(stdout: &str) -> NativeResult<InfoReport> {
    #[derive(Clone, Copy)]
    enum Section {
        Fields,
        Errors,
        Warnings,
    }

    let mut fields: BTreeMap<&str, &str> = BTreeMap::new();
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let mut section = Section::Fields;

    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(item) = line.strip_prefix("- ") {
            match section {
                Section::Errors => errors.push(item.to_string()),
                Section::Warnings => warnings.push(item.to_string()),
                Section::Fields => {}
            }
            continue;
        }
        match line {
            "Errors:" => section = Section::Errors,
            "Warnings:" => section = Section::Warnings,
            _ => {
                section = Section::Fields;
                if let Some((key, value)) = line.split_once(':') {
                    fields.insert(key.trim(), value.trim());
                }
            }
        }
    }

    let field = |key: &str| {
        fields
            .get(key)
            .copied()
            .ok_or_else(|| NativeError::malformed(format!("info report has no '{key}' line")))
    };

    let filename = Path::new(field("File")?)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let is_valid = match field("Valid")? {
        "Yes" => true,
        "No" => false,
        other => return Err(NativeError::malformed(format!("unexpected validity '{other}'"))),
    };

    let info = if is_valid {
        ModelInfo {
            filename,
            object_count: parse_number(field("Objects")?, "Objects")?,
            triangle_count: parse_number(field("Triangles")?, "Triangles")?,
            volume: parse_number(field("Volume")?.trim_end_matches("mm³").trim(), "Volume")?,
            bounding_box: field("Bounding Box")?.to_string(),
            is_valid,
        }
    } else {
        ModelInfo {
            filename,
            object_count: 0,
            triangle_count: 0,
            volume: 0.0,
            bounding_box: String::new(),
            is_valid,
        }
    };

    Ok(InfoReport {
        info,
        errors,
        warnings,
    })
}

fn parse_number<T: std::str::FromStr>(value: &str, key: &str) -> NativeResult<T> {
    value
        .parse()
        .map_err(|_| NativeError::malformed(format!("'{key}' is not a number: {value}")))
}

/// Parse `list-profiles` output for a single kind.
pub fn parse_profiles(stdout: &str, kind: PresetKind) -> ProfileListing {
    let mut listing = ProfileListing::default();
    for line in stdout.lines().map(str::trim) {
        if let Some(item) = line.strip_prefix("- ") {
            listing.names.push(item.to_string());
        } else if line.starts_with("... and ") {
            listing.truncated = true;
        }
    }
    debug!(%kind, count = listing.names.len(), "parsed profile listing");
    listing
}

/// Arguments for `slice`. Profiles missing from the request fall back to
/// `selected`.
pub fn slice_args(
    request: &SliceRequest,
    selected: &BTreeMap<PresetKind, String>,
) -> NativeResult<Vec<OsString>> {
    let mut args: Vec<OsString> = vec![
        "slice".into(),
        "--input".into(),
        request.input.as_os_str().to_owned(),
        "--output".into(),
        request.output.as_os_str().to_owned(),
        "--plate".into(),
        request.plate.to_string().into(),
    ];

    let profiles = [
        ("--printer", PresetKind::Printer, &request.printer_profile),
        ("--filament", PresetKind::Filament, &request.filament_profile),
        ("--process", PresetKind::Process, &request.process_profile),
    ];
    for (flag, kind, requested) in profiles {
        if let Some(name) = requested.as_ref().or_else(|| selected.get(&kind)) {
            args.push(flag.into());
            args.push(name.into());
        }
    }

    if !request.overrides.is_empty() {
        let mut pairs = Vec::with_capacity(request.overrides.len());
        for (key, value) in &request.overrides {
            if key.contains([',', '=']) || value.contains(',') {
                return Err(NativeError::new(
                    codes::INVALID_ARGUMENTS,
                    format!("override {key}={value} cannot be passed on the command line"),
                ));
            }
            pairs.push(format!("{key}={value}"));
        }
        args.push("--set".into());
        args.push(pairs.join(",").into());
    }

    if request.dry_run {
        args.push("--dry-run".into());
    }
    Ok(args)
}

/// Reject profiles named by `request` that were never loaded.
fn check_loaded(
    request: &SliceRequest,
    loaded: &BTreeSet<(PresetKind, String)>,
) -> NativeResult<()> {
    let named = [
        (PresetKind::Printer, &request.printer_profile),
        (PresetKind::Filament, &request.filament_profile),
        (PresetKind::Process, &request.process_profile),
    ];
    for (kind, name) in named {
        if let Some(name) = name {
            if !loaded.contains(&(kind, name.clone())) {
                return Err(NativeError::new(
                    codes::CONFIGURATION,
                    format!("{kind} profile {name} was not loaded"),
                ));
            }
        }
    }
    Ok(())
}

fn working_dir_for(resources: &Path) -> NativeResult<PathBuf> {
    let mut tail = resources.components().rev();
    let matches = RESOURCES_SUFFIX
        .iter()
        .rev()
        .all(|want| tail.next().is_some_and(|c| c.as_os_str() == *want));
    let root = resources.parent().and_then(Path::parent);
    match root {
        Some(root) if matches => Ok(root.to_path_buf()),
        _ => Err(NativeError::new(
            codes::CONFIGURATION,
            format!(
                "resources path {} must end in {}",
                resources.display(),
                RESOURCES_SUFFIX.join("/")
            ),
        )),
    }
}

fn failure_message(stderr: &str, stdout: &str, code: i32) -> String {
    [stderr, stdout]
        .into_iter()
        .flat_map(|s| s.lines().rev())
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(|l| l.strip_prefix("Error:").unwrap_or(l).trim().to_string())
        .unwrap_or_else(|| format!("slicer exited with status {code}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> SliceRequest {
        SliceRequest {
            input: PathBuf::from("/models/cube.3mf"),
            output: PathBuf::from("/out/cube.gcode"),
            plate: 2,
            printer_profile: None,
            filament_profile: Some("Bambu PLA Basic @BBL X1C".into()),
            process_profile: None,
            verbose: false,
            dry_run: true,
            overrides: BTreeMap::new(),
        }
    }

    fn strings(args: &[OsString]) -> Vec<String> {
        args.iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn test_parse_valid_info() {
        let report = parse_info(
            "Model Information:\n  File: /models/cube.3mf\n  Valid: Yes\n  Objects: 2\n  \
             Triangles: 24\n  Volume: 1234.5 mm³\n  Bounding Box: [0, 0, 0] - [20, 10, 10]\n  \
             Warnings:\n    - non-manifold edges repaired\n",
        )
        .unwrap();

        assert_eq!(
            report.info,
            ModelInfo {
                filename: "cube.3mf".into(),
                object_count: 2,
                triangle_count: 24,
                volume: 1234.5,
                bounding_box: "[0, 0, 0] - [20, 10, 10]".into(),
                is_valid: true,
            }
        );
        assert_eq!(report.warnings, vec!["non-manifold edges repaired"]);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn test_parse_invalid_info() {
        let report = parse_info(
            "Model Information:\n  File: broken.stl\n  Valid: No\n  Errors:\n    - truncated file\n",
        )
        .unwrap();
        assert!(!report.info.is_valid);
        assert_eq!(report.info.filename, "broken.stl");
        assert_eq!(report.errors, vec!["truncated file"]);
    }

    #[test]
    fn test_parse_malformed_info() {
        let err = parse_info("Model Information:\n  File: a.stl\n  Valid: Yes\n").unwrap_err();
        assert_eq!(err.code, codes::MALFORMED_OUTPUT);

        let err = parse_info("  File: a.stl\n  Valid: Yes\n  Objects: many\n").unwrap_err();
        assert_eq!(err.code, codes::MALFORMED_OUTPUT);
    }

    #[test]
    fn test_parse_profiles() {
        let listing = parse_profiles(
            "Available Profiles\n==================\n\nProcess Profiles (22):\n  \
             - 0.20mm Standard @BBL X1C\n  - 0.16mm Optimal @BBL X1C\n  ... and 20 more\n",
            PresetKind::Process,
        );
        assert_eq!(listing.names.len(), 2);
        assert!(listing.truncated);
        assert!(listing.admits("0.28mm Extra Draft @BBL X1C"));

        let listing = parse_profiles("Printer Profiles (1):\n  - Bambu Lab X1 Carbon\n", PresetKind::Printer);
        assert!(listing.admits("Bambu Lab X1 Carbon"));
        assert!(!listing.admits("Prusa MK4"));
    }

    #[test]
    fn test_slice_args() {
        let mut req = request();
        req.overrides.insert("layer_height".into(), "0.2".into());
        req.overrides.insert("curr_bed_type".into(), "High Temp Plate".into());

        let selected: BTreeMap<_, _> = [
            (PresetKind::Printer, "Bambu Lab X1 Carbon".to_string()),
            (PresetKind::Filament, "Generic PLA".to_string()),
        ]
        .into_iter()
        .collect();

        let args = strings(&slice_args(&req, &selected).unwrap());
        assert_eq!(
            args,
            vec![
                "slice",
                "--input",
                "/models/cube.3mf",
                "--output",
                "/out/cube.gcode",
                "--plate",
                "2",
                "--printer",
                "Bambu Lab X1 Carbon",
                "--filament",
                "Bambu PLA Basic @BBL X1C",
                "--set",
                "curr_bed_type=High Temp Plate,layer_height=0.2",
                "--dry-run",
            ]
        );
    }

    #[test]
    fn test_comma_in_override_rejected() {
        let mut req = request();
        req.overrides.insert("wall_sequence".into(), "inner,outer".into());
        let err = slice_args(&req, &BTreeMap::new()).unwrap_err();
        assert_eq!(err.code, codes::INVALID_ARGUMENTS);
    }

    #[test]
    fn test_working_dir_for_resources() {
        assert_eq!(
            working_dir_for(Path::new("/opt/app/OrcaSlicer/resources")).unwrap(),
            PathBuf::from("/opt/app")
        );
        let err = working_dir_for(Path::new("/opt/app/resources")).unwrap_err();
        assert_eq!(err.code, codes::CONFIGURATION);
    }

    #[test]
    fn test_failure_message() {
        assert_eq!(failure_message("Error: no printer\n", "", 4), "no printer");
        assert_eq!(failure_message("", "Slicing failed\n\n", 5), "Slicing failed");
        assert_eq!(failure_message("", "", 7), "slicer exited with status 7");
    }

    #[test]
    fn test_missing_program() {
        let mut engine = CliEngine::new("/nonexistent/orcaslicer-cli");
        assert_eq!(engine.version(), "unknown");
        let err = engine.initialize(None, false, true).unwrap_err();
        assert_eq!(err.code, codes::INITIALIZATION);
    }

    #[test]
    fn test_vendor_preset_needs_no_executable() {
        let mut engine = CliEngine::new("/nonexistent/orcaslicer-cli");
        engine.load_preset(PresetKind::Vendor, "BBL").unwrap();
        assert_eq!(engine.selected(PresetKind::Vendor), None);
    }

    #[test]
    fn test_strict_requires_loaded_profiles() {
        let req = request();
        let mut loaded = BTreeSet::new();
        let err = check_loaded(&req, &loaded).unwrap_err();
        assert_eq!(err.code, codes::CONFIGURATION);

        loaded.insert((PresetKind::Filament, "Bambu PLA Basic @BBL X1C".to_string()));
        assert!(check_loaded(&req, &loaded).is_ok());
    }

    #[test]
    fn test_load_model_missing_file() {
        let mut engine = CliEngine::default();
        let err = engine.load_model(Path::new("/nonexistent/cube.stl")).unwrap_err();
        assert_eq!(err.code, codes::FILE_NOT_FOUND);
    }

    #[cfg(unix)]
    mod scripted {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        const SCRIPT: &str = r#"#!/bin/sh
[ "$1" = "--verbose" ] && shift
case "$1" in
  version) echo "OrcaSlicer CLI 2.3.0"; echo "build test" ;;
  info)
    case "$3" in
      *broken.stl)
        echo "Model Information:"
        echo "  File: $3"
        echo "  Valid: No"
        echo "  Errors:"
        echo "    - non-manifold"
        exit 3 ;;
    esac
    echo "Model Information:"
    echo "  File: $3"
    echo "  Valid: Yes"
    echo "  Objects: 1"
    echo "  Triangles: 12"
    echo "  Volume: 1000 mm³"
    echo "  Bounding Box: [0, 0, 0] - [10, 10, 10]" ;;
  list-profiles) echo "Printer Profiles (1):"; echo "  - Bambu Lab X1 Carbon" ;;
  slice) echo "Error: Slicing failed: no printer" >&2; exit 5 ;;
  *) exit 1 ;;
esac
"#;

        fn engine(dir: &tempfile::TempDir) -> CliEngine {
            let path = dir.path().join("orcaslicer-cli");
            std::fs::write(&path, SCRIPT).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            CliEngine::new(path)
        }

        #[test]
        fn test_scripted_session() {
            let dir = tempfile::tempdir().unwrap();
            let model = dir.path().join("cube.stl");
            std::fs::write(&model, "solid cube\nendsolid cube\n").unwrap();
            let mut engine = engine(&dir);

            assert_eq!(engine.version(), "OrcaSlicer CLI 2.3.0");
            engine.initialize(None, true, false).unwrap();

            engine.load_preset(PresetKind::Printer, "Bambu Lab X1 Carbon").unwrap();
            assert_eq!(engine.selected(PresetKind::Printer), Some("Bambu Lab X1 Carbon"));
            let err = engine.load_preset(PresetKind::Printer, "Prusa MK4").unwrap_err();
            assert_eq!(err.code, codes::CONFIGURATION);

            let handle = engine.load_model(&model).unwrap();
            let info = engine.inspect(&handle).unwrap();
            assert_eq!(info.filename, "cube.stl");
            assert_eq!(info.triangle_count, 12);

            let broken = dir.path().join("broken.stl");
            std::fs::write(&broken, "solid broken\n").unwrap();
            let broken = engine.load_model(&broken).unwrap();
            let info = engine.inspect(&broken).unwrap();
            assert!(!info.is_valid);
            assert_eq!(info.filename, "broken.stl");
            assert_eq!(info.triangle_count, 0);

            let mut req = request();
            req.input = model.clone();
            let err = engine.slice_to_gcode(&handle, &req).unwrap_err();
            assert_eq!(err, NativeError::new(codes::SLICING, "Slicing failed: no printer"));

            engine.shutdown();
            assert_eq!(engine.selected(PresetKind::Printer), None);
        }
    }
}

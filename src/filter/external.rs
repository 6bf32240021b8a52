//! The external-program filter: marshals its inputs to files, runs a user
//! command over them, and reads back whatever the command leaves behind.
//!
//! This filter executes arbitrary commands and is flagged hazardous; shells
//! loading third-party state should strip or disarm it before refreshing.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use crate::filter::properties::{PropertyOutcome, PropertySet, PropertyValue};
use crate::filter::{Filter, FilterKind, FilterOps, OutputCache};
use crate::io::{load_pos, write_pos, ColumnMap};
use crate::progress::RefreshContext;
use crate::result::{FilterError, StateError};
use crate::state::{state_bool, StateContext};
use crate::stream::{
    FilterId, FilterStream, IonStream, PlotStream, StreamList, StreamMask, StreamPayload,
};

pub const KEY_COMMAND: u32 = 1;
pub const KEY_WORK_DIR: u32 = 2;
pub const KEY_CLEAN_INPUT: u32 = 3;
pub const KEY_ALWAYS_CACHE: u32 = 4;

#[derive(Debug, Clone)]
pub struct ExternalProgramFilter {
    label: String,
    cache: OutputCache,
    /// Command template; `%i`/`%I` expand to the first/all ion file names,
    /// `%p`/`%P` to the first/all plot file names, `%%` to a literal `%`.
    command_line: String,
    working_dir: String,
    clean_input: bool,
    always_cache: bool,
}

impl ExternalProgramFilter {
    pub fn new() -> ExternalProgramFilter {
        ExternalProgramFilter {
            label: "Ext. Program".to_string(),
            cache: OutputCache::new(),
            command_line: String::new(),
            working_dir: String::new(),
            clean_input: true,
            always_cache: false,
        }
    }

    /// Expands one template token against the generated file lists. A bare
    /// `%I`/`%P` token becomes one argument per file.
    fn expand_token(
        token: &str,
        ion_files: &[PathBuf],
        plot_files: &[PathBuf],
    ) -> Result<Vec<String>, FilterError> {
        let path_str = |p: &PathBuf| p.to_string_lossy().into_owned();
        if token == "%I" {
            if ion_files.is_empty() {
                return Err(FilterError::Substitute { token: 'I' });
            }
            return Ok(ion_files.iter().map(path_str).collect());
        }
        if token == "%P" {
            if plot_files.is_empty() {
                return Err(FilterError::Substitute { token: 'P' });
            }
            return Ok(plot_files.iter().map(path_str).collect());
        }

        let mut out = String::new();
        let mut chars = token.chars();
        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('%') => out.push('%'),
                Some('i') => {
                    let file = ion_files
                        .first()
                        .ok_or(FilterError::Substitute { token: 'i' })?;
                    let _ = write!(out, "{}", file.to_string_lossy());
                }
                Some('p') => {
                    let file = plot_files
                        .first()
                        .ok_or(FilterError::Substitute { token: 'p' })?;
                    let _ = write!(out, "{}", file.to_string_lossy());
                }
                Some(other) => return Err(FilterError::Substitute { token: other }),
                None => return Err(FilterError::Substitute { token: '%' }),
            }
        }
        Ok(vec![out])
    }

    fn write_intermediates(
        &self,
        inputs: &[FilterStream],
        work_dir: &Path,
    ) -> Result<(Vec<PathBuf>, Vec<PathBuf>), FilterError> {
        let mut ion_files = Vec::new();
        let mut plot_files = Vec::new();
        for stream in inputs {
            match &stream.payload {
                StreamPayload::Ions(ions) => {
                    let path = work_dir.join(format!("input{}.pos", ion_files.len()));
                    write_pos(&path, &ions.data).map_err(|_| FilterError::Intermediate {
                        source: std::io::Error::new(
                            std::io::ErrorKind::Other,
                            "pos write failed",
                        ),
                    })?;
                    ion_files.push(path);
                }
                StreamPayload::Plot(plot) => {
                    let path = work_dir.join(format!("input{}.xy", plot_files.len()));
                    let mut text = String::new();
                    for &(x, y) in &plot.xy {
                        let _ = writeln!(text, "{x}\t{y}");
                    }
                    fs::write(&path, text)
                        .map_err(|source| FilterError::Intermediate { source })?;
                    plot_files.push(path);
                }
                _ => {}
            }
        }
        Ok((ion_files, plot_files))
    }

    fn harvest_outputs(
        &self,
        work_dir: &Path,
        generated: &[PathBuf],
        self_id: FilterId,
        ctx: &mut RefreshContext<'_>,
    ) -> Result<StreamList, FilterError> {
        let mut outputs = StreamList::new();
        let mut entries: Vec<PathBuf> = fs::read_dir(work_dir)
            .map_err(|source| FilterError::WorkDir { source })?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| !generated.contains(p))
            .collect();
        entries.sort();

        for path in entries {
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase());
            match ext.as_deref() {
                Some("pos") => {
                    let ions = load_pos(&path, &ColumnMap::identity(), None, false, ctx)
                        .map_err(|_| FilterError::OutputRead {
                            path: path.to_string_lossy().into_owned(),
                        })?;
                    outputs.push(FilterStream::transient(
                        StreamPayload::Ions(Arc::new(IonStream::new(ions))),
                        self_id,
                    ));
                }
                Some("xy") => {
                    let text = fs::read_to_string(&path).map_err(|_| FilterError::OutputRead {
                        path: path.to_string_lossy().into_owned(),
                    })?;
                    let mut xy = Vec::new();
                    for line in text.lines() {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        let mut fields = line.split_whitespace();
                        let parse = |f: Option<&str>| {
                            f.and_then(|v| v.parse::<f32>().ok())
                                .ok_or_else(|| FilterError::OutputRead {
                                    path: path.to_string_lossy().into_owned(),
                                })
                        };
                        let x = parse(fields.next())?;
                        let y = parse(fields.next())?;
                        xy.push((x, y));
                    }
                    let mut plot = PlotStream::new(xy);
                    plot.title = self.label.clone();
                    outputs.push(FilterStream::transient(
                        StreamPayload::Plot(Arc::new(plot)),
                        self_id,
                    ));
                }
                _ => {}
            }
        }
        Ok(outputs)
    }
}

impl Default for ExternalProgramFilter {
    fn default() -> ExternalProgramFilter {
        ExternalProgramFilter::new()
    }
}

impl FilterOps for ExternalProgramFilter {
    fn kind(&self) -> FilterKind {
        FilterKind::ExternalProgram
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn set_label(&mut self, label: &str) {
        self.label = label.to_string();
    }

    fn cache(&self) -> &OutputCache {
        &self.cache
    }

    fn cache_mut(&mut self) -> &mut OutputCache {
        &mut self.cache
    }

    fn clone_uncached(&self) -> Filter {
        let mut copy = self.clone();
        copy.cache = OutputCache::new();
        copy.cache.set_enabled(self.cache.enabled());
        Filter::ExternalProgram(copy)
    }

    fn cache_bytes(&self, _n_objects: usize) -> Option<usize> {
        // Output size is entirely up to the external program
        None
    }

    fn refresh(
        &mut self,
        inputs: &[FilterStream],
        self_id: FilterId,
        ctx: &mut RefreshContext<'_>,
    ) -> Result<StreamList, FilterError> {
        if self.command_line.trim().is_empty() {
            return Err(FilterError::CommandLineEmpty);
        }
        if ctx.cancelled() {
            return Err(FilterError::Aborted);
        }
        ctx.begin_step(1, 2, "Collate");

        let work_dir = if self.working_dir.is_empty() {
            std::env::temp_dir().join("aptflow-extern")
        } else {
            PathBuf::from(&self.working_dir)
        };
        fs::create_dir_all(&work_dir).map_err(|source| FilterError::WorkDir { source })?;

        let (ion_files, plot_files) = self.write_intermediates(inputs, &work_dir)?;

        let mut args = Vec::new();
        for token in self.command_line.split_whitespace() {
            args.extend(Self::expand_token(token, &ion_files, &plot_files)?);
        }
        let Some((program, program_args)) = args.split_first() else {
            return Err(FilterError::CommandLineEmpty);
        };

        ctx.begin_step(2, 2, "Execute");
        let output = Command::new(program)
            .args(program_args)
            .current_dir(&work_dir)
            .output()
            .map_err(|source| FilterError::Spawn { source })?;
        if !output.status.success() {
            return Err(FilterError::CommandFailed {
                status: output.status.code().unwrap_or(-1),
            });
        }

        let generated: Vec<PathBuf> = ion_files.iter().chain(&plot_files).cloned().collect();
        let mut outputs = self.harvest_outputs(&work_dir, &generated, self_id, ctx)?;

        if self.clean_input {
            for file in &generated {
                if let Err(err) = fs::remove_file(file) {
                    log::warn!("failed to remove intermediate {}: {err}", file.display());
                }
            }
        }

        if self.always_cache && !self.cache.enabled() {
            self.cache.set_enabled(true);
        }
        self.cache.finish(&mut outputs);
        Ok(outputs)
    }

    fn properties(&self) -> Vec<PropertySet> {
        let mut set = PropertySet::new("Command");
        set.push(
            KEY_COMMAND,
            "Command",
            PropertyValue::String(self.command_line.clone()),
        );
        set.push(
            KEY_WORK_DIR,
            "Work dir",
            PropertyValue::String(self.working_dir.clone()),
        );
        set.push(
            KEY_CLEAN_INPUT,
            "Cleanup input",
            PropertyValue::Bool(self.clean_input),
        );
        set.push(
            KEY_ALWAYS_CACHE,
            "Cache",
            PropertyValue::Bool(self.always_cache),
        );
        vec![set]
    }

    fn set_property(&mut self, key: u32, value: &PropertyValue) -> PropertyOutcome {
        match key {
            KEY_COMMAND => {
                let Some(command) = value.as_str() else {
                    return PropertyOutcome::rejected();
                };
                if command == self.command_line {
                    return PropertyOutcome::unchanged();
                }
                self.command_line = command.to_string();
                self.cache.clear();
                PropertyOutcome::refresh()
            }
            KEY_WORK_DIR => {
                let Some(dir) = value.as_str() else {
                    return PropertyOutcome::rejected();
                };
                if dir == self.working_dir {
                    return PropertyOutcome::unchanged();
                }
                self.working_dir = dir.to_string();
                self.cache.clear();
                PropertyOutcome::refresh()
            }
            KEY_CLEAN_INPUT => {
                let Some(clean) = value.as_bool() else {
                    return PropertyOutcome::rejected();
                };
                if clean == self.clean_input {
                    return PropertyOutcome::unchanged();
                }
                self.clean_input = clean;
                PropertyOutcome::unchanged()
            }
            KEY_ALWAYS_CACHE => {
                let Some(always) = value.as_bool() else {
                    return PropertyOutcome::rejected();
                };
                if always == self.always_cache {
                    return PropertyOutcome::unchanged();
                }
                self.always_cache = always;
                PropertyOutcome::unchanged()
            }
            _ => PropertyOutcome::rejected(),
        }
    }

    fn use_mask(&self) -> StreamMask {
        StreamMask::IONS | StreamMask::PLOT
    }

    fn block_mask(&self) -> StreamMask {
        StreamMask::IONS | StreamMask::PLOT
    }

    fn emit_mask(&self) -> StreamMask {
        StreamMask::IONS | StreamMask::PLOT
    }

    fn is_hazardous(&self) -> bool {
        true
    }

    fn state_tags(&self) -> Vec<(&'static str, String)> {
        vec![
            ("command", self.command_line.clone()),
            ("workdir", crate::state::encode_path(&self.working_dir)),
            ("cleaninput", (self.clean_input as u8).to_string()),
            ("alwayscache", (self.always_cache as u8).to_string()),
        ]
    }

    fn restore_tag(
        &mut self,
        tag: &str,
        value: &str,
        state: &StateContext,
    ) -> Result<(), StateError> {
        match tag {
            "command" => self.command_line = value.to_string(),
            "workdir" => self.working_dir = state.decode_path(value),
            "cleaninput" => self.clean_input = state_bool(value)?,
            "alwayscache" => self.always_cache = state_bool(value)?,
            _ => {
                return crate::result::state_error(format!("unknown externalprog tag `{tag}`"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::run_unwatched;
    use crate::types::{IonHit, Point3};

    fn ion_input(n: usize) -> Vec<FilterStream> {
        let hits: Vec<IonHit> = (0..n)
            .map(|i| IonHit::new(Point3::ORIGIN, i as f32))
            .collect();
        vec![FilterStream::transient(
            StreamPayload::Ions(Arc::new(IonStream::new(hits))),
            FilterId::DETACHED,
        )]
    }

    #[test]
    fn empty_command_is_rejected() {
        let mut filter = ExternalProgramFilter::new();
        let result = run_unwatched(|ctx| filter.refresh(&[], FilterId::DETACHED, ctx));
        assert!(matches!(result, Err(FilterError::CommandLineEmpty)));
    }

    #[test]
    fn unknown_substitution_is_rejected() {
        let mut filter = ExternalProgramFilter::new();
        filter.set_property(KEY_COMMAND, &PropertyValue::String("echo %q".to_string()));
        let dir = tempfile::tempdir().unwrap();
        filter.set_property(
            KEY_WORK_DIR,
            &PropertyValue::String(dir.path().to_string_lossy().into_owned()),
        );
        let result = run_unwatched(|ctx| filter.refresh(&[], FilterId::DETACHED, ctx));
        assert!(matches!(
            result,
            Err(FilterError::Substitute { token: 'q' })
        ));
    }

    #[test]
    fn ion_substitution_without_ions_is_rejected() {
        let mut filter = ExternalProgramFilter::new();
        filter.set_property(KEY_COMMAND, &PropertyValue::String("cat %i".to_string()));
        let dir = tempfile::tempdir().unwrap();
        filter.set_property(
            KEY_WORK_DIR,
            &PropertyValue::String(dir.path().to_string_lossy().into_owned()),
        );
        let result = run_unwatched(|ctx| filter.refresh(&[], FilterId::DETACHED, ctx));
        assert!(matches!(result, Err(FilterError::Substitute { token: 'i' })));
    }

    #[cfg(unix)]
    #[test]
    fn round_trips_ions_through_a_command() {
        let mut filter = ExternalProgramFilter::new();
        let dir = tempfile::tempdir().unwrap();
        filter.set_property(
            KEY_WORK_DIR,
            &PropertyValue::String(dir.path().to_string_lossy().into_owned()),
        );
        filter.set_property(
            KEY_COMMAND,
            &PropertyValue::String("cp %i result.pos".to_string()),
        );

        let inputs = ion_input(12);
        let outputs =
            run_unwatched(|ctx| filter.refresh(&inputs, FilterId::DETACHED, ctx)).unwrap();
        assert_eq!(outputs.len(), 1);
        let ions = outputs[0].expect_ions().unwrap();
        assert_eq!(ions.data.len(), 12);
        // The generated input file was cleaned up, the result remains
        assert!(!dir.path().join("input0.pos").exists());
        assert!(dir.path().join("result.pos").exists());
    }

    #[cfg(unix)]
    #[test]
    fn failing_command_reports_status() {
        let mut filter = ExternalProgramFilter::new();
        let dir = tempfile::tempdir().unwrap();
        filter.set_property(
            KEY_WORK_DIR,
            &PropertyValue::String(dir.path().to_string_lossy().into_owned()),
        );
        filter.set_property(KEY_COMMAND, &PropertyValue::String("false".to_string()));
        let result = run_unwatched(|ctx| filter.refresh(&[], FilterId::DETACHED, ctx));
        assert!(matches!(
            result,
            Err(FilterError::CommandFailed { status: 1 })
        ));
    }
}

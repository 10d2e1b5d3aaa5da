//! Handlers for the host minifier's extension points.
//!
//! Every extension point passes a value through a [`Pipeline`] of handlers in
//! registration order; each handler may inspect or replace the value. The
//! session registers a trace monitor for the input, then the auto-mode
//! engine, then a trace monitor for the output.

use std::collections::BTreeSet;
use std::fmt::Debug;
use std::path::PathBuf;

use log::{debug, warn};
use serde_json::Value;

use crate::atomic::write_atomic;
use crate::autojs::{ExcludedTagData, LocalScriptData, StepData};
use crate::session::RequestContext;
use crate::types::SyncType;

/// One handler of the host's extension points. Every method passes its value
/// through unchanged unless overridden.
#[allow(unused_variables)]
pub trait MinifyExtension {
    fn name(&self) -> &'static str;

    fn process_content(&mut self, ctx: &mut RequestContext, buffer: String) -> String {
        buffer
    }

    fn processed_content(&mut self, ctx: &mut RequestContext, buffer: String) -> String {
        buffer
    }

    fn script_tags(&mut self, ctx: &mut RequestContext, script_tags: Vec<String>) -> Vec<String> {
        script_tags
    }

    fn local_script(&mut self, ctx: &mut RequestContext, data: LocalScriptData) -> LocalScriptData {
        data
    }

    fn tag_minification(
        &mut self,
        ctx: &mut RequestContext,
        do_tag_minification: bool,
        script_tag: &str,
        file: &str,
    ) -> bool {
        do_tag_minification
    }

    fn excluded_tag(&mut self, ctx: &mut RequestContext, data: ExcludedTagData) -> ExcludedTagData {
        data
    }

    fn flush_collected(
        &mut self,
        ctx: &mut RequestContext,
        do_flush_collected: bool,
        last_script_tag: &str,
        sync_type: SyncType,
    ) -> bool {
        do_flush_collected
    }

    fn step(&mut self, ctx: &mut RequestContext, data: StepData) -> StepData {
        data
    }

    fn step_script_to_embed(&mut self, ctx: &mut RequestContext, data: Value) -> Value {
        data
    }

    fn minify_filename(
        &mut self,
        ctx: &mut RequestContext,
        minify_filename: String,
        files: &[String],
        kind: &str,
    ) -> String {
        minify_filename
    }

    fn file_handler_options(&mut self, ctx: &mut RequestContext, serve_options: Value) -> Value {
        serve_options
    }
}

/// Ordered list of handlers.
#[derive(Default)]
pub struct Pipeline {
    handlers: Vec<Box<dyn MinifyExtension>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handler: Box<dyn MinifyExtension>) {
        debug!("registered extension handler {}", handler.name());
        self.handlers.push(handler);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    pub fn process_content(&mut self, ctx: &mut RequestContext, buffer: String) -> String {
        self.handlers
            .iter_mut()
            .fold(buffer, |v, h| h.process_content(ctx, v))
    }

    pub fn processed_content(&mut self, ctx: &mut RequestContext, buffer: String) -> String {
        self.handlers
            .iter_mut()
            .fold(buffer, |v, h| h.processed_content(ctx, v))
    }

    pub fn script_tags(&mut self, ctx: &mut RequestContext, script_tags: Vec<String>) -> Vec<String> {
        self.handlers
            .iter_mut()
            .fold(script_tags, |v, h| h.script_tags(ctx, v))
    }

    pub fn local_script(&mut self, ctx: &mut RequestContext, data: LocalScriptData) -> LocalScriptData {
        self.handlers
            .iter_mut()
            .fold(data, |v, h| h.local_script(ctx, v))
    }

    pub fn tag_minification(
        &mut self,
        ctx: &mut RequestContext,
        do_tag_minification: bool,
        script_tag: &str,
        file: &str,
    ) -> bool {
        self.handlers
            .iter_mut()
            .fold(do_tag_minification, |v, h| h.tag_minification(ctx, v, script_tag, file))
    }

    pub fn excluded_tag(&mut self, ctx: &mut RequestContext, data: ExcludedTagData) -> ExcludedTagData {
        self.handlers
            .iter_mut()
            .fold(data, |v, h| h.excluded_tag(ctx, v))
    }

    pub fn flush_collected(
        &mut self,
        ctx: &mut RequestContext,
        do_flush_collected: bool,
        last_script_tag: &str,
        sync_type: SyncType,
    ) -> bool {
        self.handlers.iter_mut().fold(do_flush_collected, |v, h| {
            h.flush_collected(ctx, v, last_script_tag, sync_type)
        })
    }

    pub fn step(&mut self, ctx: &mut RequestContext, data: StepData) -> StepData {
        self.handlers.iter_mut().fold(data, |v, h| h.step(ctx, v))
    }

    pub fn step_script_to_embed(&mut self, ctx: &mut RequestContext, data: Value) -> Value {
        self.handlers
            .iter_mut()
            .fold(data, |v, h| h.step_script_to_embed(ctx, v))
    }

    pub fn minify_filename(
        &mut self,
        ctx: &mut RequestContext,
        minify_filename: String,
        files: &[String],
        kind: &str,
    ) -> String {
        self.handlers
            .iter_mut()
            .fold(minify_filename, |v, h| h.minify_filename(ctx, v, files, kind))
    }

    pub fn file_handler_options(&mut self, ctx: &mut RequestContext, serve_options: Value) -> Value {
        self.handlers
            .iter_mut()
            .fold(serve_options, |v, h| h.file_handler_options(ctx, v))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceStage {
    Input,
    Output,
}

impl TraceStage {
    fn as_str(self) -> &'static str {
        match self {
            TraceStage::Input => "in",
            TraceStage::Output => "out",
        }
    }
}

/// Logs the values of the extension points named in `filters`.
///
/// At the output stage the `process_content` and `processed_content` buffers
/// are also written to `dump_dir`.
pub struct TraceMonitor {
    stage: TraceStage,
    filters: BTreeSet<String>,
    dump_dir: Option<PathBuf>,
}

impl TraceMonitor {
    pub fn new(stage: TraceStage, filters: BTreeSet<String>, dump_dir: Option<PathBuf>) -> Self {
        Self {
            stage,
            filters,
            dump_dir,
        }
    }

    fn trace<T: Debug + ?Sized>(&self, hook: &str, value: &T) {
        if self.filters.contains(hook) {
            debug!("FILTER::{hook} ({}): {value:?}", self.stage.as_str());
        }
    }

    fn dump(&self, hook: &str, buffer: &str) {
        if self.stage != TraceStage::Output || !self.filters.contains(hook) {
            return;
        }
        let Some(dir) = &self.dump_dir else {
            return;
        };
        let path = dir.join(format!("filter_{hook}_buffer"));
        if let Err(e) = write_atomic(&path, buffer.as_bytes()) {
            warn!("failed to dump {hook} buffer: {e:#}");
        }
    }
}

impl MinifyExtension for TraceMonitor {
    fn name(&self) -> &'static str {
        match self.stage {
            TraceStage::Input => "trace-input",
            TraceStage::Output => "trace-output",
        }
    }

    fn process_content(&mut self, _ctx: &mut RequestContext, buffer: String) -> String {
        self.trace("process_content", &format!("{} bytes", buffer.len()));
        self.dump("process_content", &buffer);
        buffer
    }

    fn processed_content(&mut self, _ctx: &mut RequestContext, buffer: String) -> String {
        self.trace("processed_content", &format!("{} bytes", buffer.len()));
        self.dump("processed_content", &buffer);
        buffer
    }

    fn script_tags(&mut self, _ctx: &mut RequestContext, script_tags: Vec<String>) -> Vec<String> {
        self.trace("script_tags", &script_tags);
        script_tags
    }

    fn local_script(&mut self, ctx: &mut RequestContext, data: LocalScriptData) -> LocalScriptData {
        self.trace("local_script", &data);
        if self.stage == TraceStage::Output {
            self.trace("local_script", ctx.auto.shadow.entries());
        }
        data
    }

    fn tag_minification(
        &mut self,
        ctx: &mut RequestContext,
        do_tag_minification: bool,
        script_tag: &str,
        file: &str,
    ) -> bool {
        self.trace("tag_minification", &(do_tag_minification, script_tag, file));
        if self.stage == TraceStage::Output {
            self.trace("tag_minification", ctx.auto.shadow.entries());
        }
        do_tag_minification
    }

    fn excluded_tag(&mut self, _ctx: &mut RequestContext, data: ExcludedTagData) -> ExcludedTagData {
        self.trace("excluded_tag", &data);
        data
    }

    fn flush_collected(
        &mut self,
        _ctx: &mut RequestContext,
        do_flush_collected: bool,
        last_script_tag: &str,
        sync_type: SyncType,
    ) -> bool {
        self.trace(
            "flush_collected",
            &(do_flush_collected, last_script_tag, sync_type),
        );
        do_flush_collected
    }

    fn step(&mut self, ctx: &mut RequestContext, data: StepData) -> StepData {
        self.trace("step", &data);
        if self.stage == TraceStage::Input {
            self.trace("step", &ctx.auto.last_tag);
        }
        data
    }

    fn step_script_to_embed(&mut self, _ctx: &mut RequestContext, data: Value) -> Value {
        self.trace("step_script_to_embed", &data);
        data
    }

    fn minify_filename(
        &mut self,
        _ctx: &mut RequestContext,
        minify_filename: String,
        files: &[String],
        kind: &str,
    ) -> String {
        self.trace("minify_filename", &(&minify_filename, files, kind));
        minify_filename
    }

    fn file_handler_options(&mut self, _ctx: &mut RequestContext, serve_options: Value) -> Value {
        self.trace("file_handler_options", &serve_options);
        serve_options
    }
}

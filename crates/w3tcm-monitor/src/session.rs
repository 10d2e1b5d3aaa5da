//! One request: the per-request context and the dispatch of host events to
//! the mode-specific handlers.

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::Result;
use log::{debug, error};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::autojs::{
    placeholder_scripts, AutoMinifyMonitor, AutoState, ExcludedTagData, LocalScriptData,
    PlaceholderScript, ScriptSink, SiteResolver, StepData,
};
use crate::builder::ConfigBuilder;
use crate::extension::{Pipeline, TraceMonitor, TraceStage};
use crate::notices::NoticeQueue;
use crate::recorder::{ScriptRecorder, ScriptTag};
use crate::store::Store;
use crate::types::{Diagnostic, OrderedFileList, SyncType, TemplateEntry, TemplateKey, ThemeInfo};

/// What the manual-mode recorder does with the rest of the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecordState {
    /// Nothing is recorded: no template yet, or it is `DO-NOT-MINIFY`.
    #[default]
    Skip,
    Record,
    /// The template was overridden; store `DO-NOT-MINIFY` at shutdown.
    ForceDoNotMinify,
}

/// Everything one request accumulates. Created when the request starts and
/// dropped when it ends.
#[derive(Debug)]
pub struct RequestContext {
    pub store: Store,
    pub now: u64,
    pub override_do_not_minify: bool,
    pub key: Option<TemplateKey>,
    /// The first template the host resolved for this request.
    pub initial_template: Option<String>,
    pub state: RecordState,
    pub files: OrderedFileList,
    pub notices: NoticeQueue,
    pub diagnostics: Vec<Diagnostic>,
    pub auto: AutoState,
    /// Recorded script tags so far.
    pub emitted: usize,
}

impl RequestContext {
    pub fn new(store: Store, now: u64, override_do_not_minify: bool) -> Self {
        Self {
            store,
            now,
            override_do_not_minify,
            key: None,
            initial_template: None,
            state: RecordState::default(),
            files: OrderedFileList::default(),
            notices: NoticeQueue::new(),
            diagnostics: Vec::new(),
            auto: AutoState::default(),
            emitted: 0,
        }
    }
}

/// A call the host makes during one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "hook", rename_all = "snake_case")]
pub enum HostEvent {
    TemplateInclude {
        template: String,
        theme: ThemeInfo,
        #[serde(default)]
        theme_key: Option<String>,
    },
    ScriptLoaderTag(ScriptTag),
    EnqueueScripts,
    ProcessContent {
        buffer: String,
    },
    ProcessedContent {
        buffer: String,
    },
    ScriptTags {
        script_tags: Vec<String>,
    },
    LocalScript(LocalScriptData),
    TagMinification {
        do_tag_minification: bool,
        script_tag: String,
        file: String,
    },
    ExcludedTag(ExcludedTagData),
    FlushCollected {
        do_flush_collected: bool,
        last_script_tag: String,
        sync_type: SyncType,
    },
    Step(StepData),
    StepScriptToEmbed {
        data: Value,
    },
    MinifyFilename {
        minify_filename: String,
        files: Vec<String>,
        #[serde(rename = "type", default)]
        kind: String,
    },
    FileHandlerOptions {
        serve_options: Value,
    },
    Shutdown,
}

impl HostEvent {
    pub fn hook(&self) -> &'static str {
        match self {
            HostEvent::TemplateInclude { .. } => "template_include",
            HostEvent::ScriptLoaderTag(_) => "script_loader_tag",
            HostEvent::EnqueueScripts => "enqueue_scripts",
            HostEvent::ProcessContent { .. } => "process_content",
            HostEvent::ProcessedContent { .. } => "processed_content",
            HostEvent::ScriptTags { .. } => "script_tags",
            HostEvent::LocalScript(_) => "local_script",
            HostEvent::TagMinification { .. } => "tag_minification",
            HostEvent::ExcludedTag(_) => "excluded_tag",
            HostEvent::FlushCollected { .. } => "flush_collected",
            HostEvent::Step(_) => "step",
            HostEvent::StepScriptToEmbed { .. } => "step_script_to_embed",
            HostEvent::MinifyFilename { .. } => "minify_filename",
            HostEvent::FileHandlerOptions { .. } => "file_handler_options",
            HostEvent::Shutdown => "shutdown",
        }
    }
}

/// The value handed back to the host for one event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum HostResponse {
    None,
    Flag(bool),
    Text(String),
    ScriptTags(Vec<String>),
    Enqueue(Vec<PlaceholderScript>),
    LocalScript(LocalScriptData),
    ExcludedTag(ExcludedTagData),
    Step(StepData),
    Value(Value),
}

/// A recorded request: the override flag from its query string and the
/// host events in call order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestTrace {
    #[serde(default)]
    pub override_do_not_minify: bool,
    #[serde(default)]
    pub events: Vec<HostEvent>,
}

/// Site options a session needs.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub use_include: bool,
    pub auto_minify: bool,
    pub monitor_filters: BTreeSet<String>,
    pub files_to_skip: Vec<String>,
    pub output_dir: PathBuf,
    pub host_config: Option<PathBuf>,
    /// Base URL of the placeholder scripts.
    pub plugin_url: String,
    pub site_url: String,
    pub external_scripts: Vec<String>,
}

/// The end state of a finished request.
#[derive(Debug)]
pub struct RequestOutcome {
    pub store: Store,
    pub diagnostics: Vec<Diagnostic>,
}

/// Drives one request.
///
/// Extension points run through the trace monitor for the input first, the
/// auto-mode engine second and the trace monitor for the output last. Template
/// and script tag events go to the recorder in manual mode only.
pub struct Session {
    ctx: RequestContext,
    pipeline: Pipeline,
    recorder: Option<ScriptRecorder>,
    builder: ConfigBuilder,
    auto_minify: bool,
    plugin_url: String,
    shut_down: bool,
}

impl Session {
    pub fn new(
        options: &SessionOptions,
        mut store: Store,
        now: u64,
        override_do_not_minify: bool,
        sink: Box<dyn ScriptSink>,
    ) -> Self {
        store.prune_misc(now);

        let mut pipeline = Pipeline::new();
        let dump_dir = Some(options.output_dir.clone());
        if !options.monitor_filters.is_empty() {
            pipeline.push(Box::new(TraceMonitor::new(
                TraceStage::Input,
                options.monitor_filters.clone(),
                dump_dir.clone(),
            )));
        }
        if options.auto_minify {
            let resolver =
                SiteResolver::new(options.site_url.clone(), options.external_scripts.clone());
            pipeline.push(Box::new(AutoMinifyMonitor::new(sink, Box::new(resolver))));
        }
        if !options.monitor_filters.is_empty() {
            pipeline.push(Box::new(TraceMonitor::new(
                TraceStage::Output,
                options.monitor_filters.clone(),
                dump_dir,
            )));
        }

        let recorder = (!options.auto_minify)
            .then(|| ScriptRecorder::new(options.use_include, options.files_to_skip.clone()));

        Self {
            ctx: RequestContext::new(store, now, override_do_not_minify),
            pipeline,
            recorder,
            builder: ConfigBuilder::new(&options.output_dir, options.host_config.clone()),
            auto_minify: options.auto_minify,
            plugin_url: options.plugin_url.clone(),
            shut_down: false,
        }
    }

    pub fn context(&self) -> &RequestContext {
        &self.ctx
    }

    pub fn handlers(&self) -> Vec<&'static str> {
        self.pipeline.names()
    }

    pub fn handle(&mut self, event: HostEvent) -> HostResponse {
        debug!("host event {}", event.hook());
        let ctx = &mut self.ctx;
        let pipeline = &mut self.pipeline;
        match event {
            HostEvent::TemplateInclude {
                template,
                theme,
                theme_key,
            } => {
                if let Some(recorder) = &self.recorder {
                    recorder.resolve_template(ctx, &template, &theme, theme_key.as_deref());
                }
                HostResponse::Text(template)
            }
            HostEvent::ScriptLoaderTag(tag) => {
                if let Some(recorder) = &self.recorder {
                    recorder.on_script_tag(ctx, &tag);
                }
                HostResponse::Text(tag.tag)
            }
            HostEvent::EnqueueScripts => {
                if self.auto_minify {
                    HostResponse::Enqueue(placeholder_scripts(&self.plugin_url))
                } else {
                    HostResponse::Enqueue(Vec::new())
                }
            }
            HostEvent::ProcessContent { buffer } => {
                HostResponse::Text(pipeline.process_content(ctx, buffer))
            }
            HostEvent::ProcessedContent { buffer } => {
                HostResponse::Text(pipeline.processed_content(ctx, buffer))
            }
            HostEvent::ScriptTags { script_tags } => {
                HostResponse::ScriptTags(pipeline.script_tags(ctx, script_tags))
            }
            HostEvent::LocalScript(data) => HostResponse::LocalScript(pipeline.local_script(ctx, data)),
            HostEvent::TagMinification {
                do_tag_minification,
                script_tag,
                file,
            } => HostResponse::Flag(pipeline.tag_minification(
                ctx,
                do_tag_minification,
                &script_tag,
                &file,
            )),
            HostEvent::ExcludedTag(data) => HostResponse::ExcludedTag(pipeline.excluded_tag(ctx, data)),
            HostEvent::FlushCollected {
                do_flush_collected,
                last_script_tag,
                sync_type,
            } => HostResponse::Flag(pipeline.flush_collected(
                ctx,
                do_flush_collected,
                &last_script_tag,
                sync_type,
            )),
            HostEvent::Step(data) => HostResponse::Step(pipeline.step(ctx, data)),
            HostEvent::StepScriptToEmbed { data } => {
                HostResponse::Value(pipeline.step_script_to_embed(ctx, data))
            }
            HostEvent::MinifyFilename {
                minify_filename,
                files,
                kind,
            } => HostResponse::Text(pipeline.minify_filename(ctx, minify_filename, &files, &kind)),
            HostEvent::FileHandlerOptions { serve_options } => {
                HostResponse::Value(pipeline.file_handler_options(ctx, serve_options))
            }
            HostEvent::Shutdown => {
                self.shutdown();
                HostResponse::None
            }
        }
    }

    /// End of request: in manual mode, store what was recorded for the
    /// template. Failures are logged and never reach the host.
    fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        if self.recorder.is_none() {
            return;
        }
        let ctx = &mut self.ctx;
        let Some(key) = ctx.key.clone() else {
            return;
        };
        let entry = match ctx.state {
            RecordState::Skip => return,
            RecordState::Record => TemplateEntry::Files(std::mem::take(&mut ctx.files)),
            RecordState::ForceDoNotMinify => TemplateEntry::DO_NOT_MINIFY,
        };
        let override_do_not_minify = ctx.override_do_not_minify;
        let now = ctx.now;
        if let Err(e) = self.builder.update_database(
            ctx.store.db_mut(),
            &mut ctx.notices,
            &key,
            entry,
            override_do_not_minify,
            now,
        ) {
            error!("failed to update template {key}: {e:#}");
        }
    }

    /// Shut down if the host did not, then save the store.
    pub fn finish(mut self) -> Result<RequestOutcome> {
        self.shutdown();
        let mut ctx = self.ctx;
        ctx.store.save()?;
        Ok(RequestOutcome {
            store: ctx.store,
            diagnostics: ctx.diagnostics,
        })
    }
}

/// Run every event of `trace` through a new session and finish it.
pub fn replay_trace(
    options: &SessionOptions,
    store: Store,
    now: u64,
    trace: RequestTrace,
    sink: Box<dyn ScriptSink>,
) -> Result<(Vec<HostResponse>, RequestOutcome)> {
    let mut session = Session::new(options, store, now, trace.override_do_not_minify, sink);
    let responses = trace
        .events
        .into_iter()
        .map(|event| session.handle(event))
        .collect();
    Ok((responses, session.finish()?))
}

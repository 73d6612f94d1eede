//! Top-level run orchestration.
//!
//! Wires the whole run together: compile every pipeline description into the
//! store, resolve cross-references, optionally apply the resume pass, then
//! spawn the completion listener and the dispatcher and await the supervision
//! monitor as the completion signal.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::compiler::{compile_pipeline, resolve_cross_references, CompilerContext, PipelineSpec};
use crate::config::RunConfig;
use crate::error::Result;
use crate::exec::Dispatcher;
use crate::monitor::{RunOutcome, SupervisionMonitor};
use crate::net::{CompletionListener, RemoteTransport, ReportHandler, TcpTransport};
use crate::store::{resume, CommandStore};

pub struct Coordinator {
    config: RunConfig,
    transport: Arc<dyn RemoteTransport>,
    listener: Option<CompletionListener>,
}

impl Coordinator {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            transport: Arc::new(TcpTransport),
            listener: None,
        }
    }

    /// Swap the remote transport (tests, alternative worker protocols).
    pub fn with_transport(mut self, transport: Arc<dyn RemoteTransport>) -> Self {
        self.transport = transport;
        self
    }

    /// Use an already-bound completion listener instead of binding
    /// `listen_addr`, so callers can learn the OS-assigned port up front.
    pub fn with_listener(mut self, listener: CompletionListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Run the scheduler to completion. `pipelines` are description file
    /// paths; they are ignored on resume, where the existing store already
    /// holds the compiled run.
    pub async fn run(
        mut self,
        pipelines: &[PathBuf],
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        let store = if self.config.resume {
            let store = CommandStore::open(&self.config.store_path).await?;
            let report = resume::resume(&store).await?;
            tracing::info!(
                reset = report.total_reset(),
                kept_done = report.kept_done,
                "Resuming existing run"
            );
            store
        } else {
            self.compile(pipelines).await?
        };

        tracing::info!(
            run_id = %store.run_id().await,
            commands = store.len().await,
            workers = self.config.workers.len(),
            "Starting run"
        );

        // Completion listener: remote workers call back here.
        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => CompletionListener::bind(self.config.listen_addr).await?,
        };
        let handler = ReportHandler::new(
            store.clone(),
            self.config.benign_error_patterns.clone(),
        );
        let listener_cancel = cancel.child_token();
        tokio::spawn(async move {
            listener.run(handler, listener_cancel).await;
        });

        // Dispatcher loop.
        let dispatcher = Dispatcher::new(store.clone(), &self.config, self.transport.clone());
        let dispatcher_cancel = cancel.child_token();
        tokio::spawn(async move {
            dispatcher.run(dispatcher_cancel).await;
        });

        // Await supervision as the one-shot completion signal.
        let monitor = SupervisionMonitor::new(store.clone(), self.config.poll_interval);
        let outcome = monitor.run(cancel.child_token()).await;

        // Stop the loops; in-flight remote work is never forcibly killed.
        cancel.cancel();
        Ok(outcome)
    }

    /// Two-phase compile: every description first, placeholders resolved once
    /// at the end, so dependencies may reference tasks of files parsed later.
    async fn compile(&mut self, pipelines: &[PathBuf]) -> Result<CommandStore> {
        let mut specs = Vec::with_capacity(pipelines.len());
        for path in pipelines {
            specs.push(PipelineSpec::from_path(path).await?);
        }

        // The description may contribute workers when the CLI gave none.
        if self.config.workers.is_empty() {
            for spec in &specs {
                if !spec.workers.is_empty() {
                    self.config.workers = spec.workers.clone();
                    break;
                }
            }
        }

        let store = CommandStore::create(&self.config.store_path).await?;
        let mut ctx = CompilerContext::new(self.config.workers.clone());
        for spec in &specs {
            compile_pipeline(spec, &mut ctx, &store).await?;
        }
        resolve_cross_references(&store, &ctx).await?;
        Ok(store)
    }
}

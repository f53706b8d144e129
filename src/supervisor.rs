//! Supervisor: wires the configured components, owns the client lifecycle
//! and turns interrupts into an orderly shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::analyser::Analyser;
use crate::client::ChatClient;
use crate::config::{AppConfig, Component};
use crate::db::Store;
use crate::error::CrawlError;
use crate::interaction::InteractionHandler;
use crate::mirror::{MirrorClient, MirrorServer};
use crate::observer::InsideObserver;
use crate::scanner::Scanner;
use crate::watcher::Watcher;

/// Cooldown before a dead background job is started again.
const RESTART_COOLDOWN: Duration = Duration::from_secs(1);

/// Run a background job in a loop, restarting it after a cooldown when it
/// fails or exits, until shutdown is signalled.
pub fn spawn_restarting<F, Fut>(
    name: &'static str,
    mut shutdown: watch::Receiver<bool>,
    factory: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), CrawlError>> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                result = factory() => match result {
                    Ok(()) => println!("ℹ️ {name}: background job exited"),
                    Err(e) => eprintln!("⚠️ {name}: background job failed: {e}"),
                },
            }
            // rate-limit restarts
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(RESTART_COOLDOWN) => {}
            }
        }
    })
}

fn spawn_signal_listener(shutdown: watch::Sender<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(_) => {
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        println!("🛑 supervisor: interrupt received, shutting down");
        let _ = shutdown.send(true);
    })
}

/// Wire the configured components and run until the client terminates or
/// an interrupt arrives.
pub async fn run<C: ChatClient>(
    config: AppConfig,
    store: Arc<Store>,
    client: Arc<C>,
) -> Result<(), CrawlError> {
    if config.has(Component::MirrorClient)
        && (config.has(Component::Watcher)
            || config.has(Component::Scanner)
            || config.has(Component::Interaction)
            || config.has(Component::Insideman))
    {
        return Err(CrawlError::Validation(
            "mirror-client cannot be combined with watcher, scanner, interaction \
             or insideman: it needs exclusive control over the database"
                .to_string(),
        ));
    }

    for domain in &config.seed {
        store.require_domain(domain, None)?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal_task = spawn_signal_listener(shutdown_tx.clone());

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let watcher = config.has(Component::Watcher).then(|| {
        Arc::new(Watcher::new(
            Arc::clone(&store),
            Arc::clone(&client),
            config.avatar_whitelist.clone(),
        ))
    });

    let analyser = Analyser::new(
        Arc::clone(&store),
        Arc::clone(&client),
        watcher.as_ref().map(|w| w.handle()),
    );
    let (analysis, analysis_pool) = analyser.spawn_pool();

    if let Some(watcher) = watcher.clone() {
        tasks.push(spawn_restarting("watcher", shutdown_rx.clone(), move || {
            let watcher = Arc::clone(&watcher);
            async move { watcher.run().await }
        }));
    }

    let scanner = config.has(Component::Scanner).then(|| {
        Arc::new(Scanner::new(
            Arc::clone(&store),
            Arc::clone(&client),
            analysis.clone(),
        ))
    });
    if let Some(scanner) = scanner.clone() {
        tasks.push(spawn_restarting("scanner", shutdown_rx.clone(), move || {
            let scanner = Arc::clone(&scanner);
            async move { scanner.run().await }
        }));
    }

    if config.has(Component::Insideman) {
        let observer = Arc::new(InsideObserver::new(
            Arc::clone(&store),
            Arc::clone(&client),
            analysis.clone(),
            config.nickname.clone(),
            config.nrooms,
        ));
        tasks.push(spawn_restarting("observer", shutdown_rx.clone(), move || {
            let observer = Arc::clone(&observer);
            async move { observer.run().await }
        }));
    }

    if config.has(Component::Interaction) {
        let handler = Arc::new(InteractionHandler::new(
            Arc::clone(&client),
            analysis.clone(),
            config.privileged_entities.clone(),
        ));
        match client.take_inbound_messages() {
            Some(messages) => {
                tasks.push(tokio::spawn(async move { handler.run(messages).await }));
            }
            None => eprintln!("⚠️ supervisor: inbound message stream unavailable"),
        }
    }

    if config.has(Component::Spokesman) {
        // the query handler itself is served to the view layer; nothing to spawn
        println!("🗣️ supervisor: search endpoint enabled");
    }

    let mirror_server = if config.has(Component::MirrorServer) {
        match &config.mirror.server.pubsub_service {
            Some(target) => {
                let server = Arc::new(MirrorServer::new(
                    Arc::clone(&store),
                    Arc::clone(&client),
                    target.clone(),
                ));
                let run_server = Arc::clone(&server);
                tasks.push(spawn_restarting(
                    "mirror-server",
                    shutdown_rx.clone(),
                    move || {
                        let server = Arc::clone(&run_server);
                        async move { server.run().await }
                    },
                ));
                Some(server)
            }
            None => {
                eprintln!("⚠️ supervisor: mirror-server enabled without a publish target");
                None
            }
        }
    } else {
        None
    };

    if config.has(Component::MirrorClient) {
        match &config.mirror.client.pubsub_service {
            Some(source) => {
                let mirror = Arc::new(MirrorClient::new(
                    Arc::clone(&store),
                    Arc::clone(&client),
                    source.clone(),
                ));
                tasks.push(spawn_restarting(
                    "mirror-client",
                    shutdown_rx.clone(),
                    move || {
                        let mirror = Arc::clone(&mirror);
                        async move { mirror.run().await }
                    },
                ));
            }
            None => eprintln!("⚠️ supervisor: mirror-client enabled without a source"),
        }
    }

    let mut shutdown_watch = shutdown_rx.clone();
    tokio::select! {
        _ = client.wait_closed() => println!("🛑 supervisor: client connection ended"),
        _ = shutdown_watch.changed() => {}
    }
    let _ = shutdown_tx.send(true);

    analysis_pool.close(false);
    if let Some(watcher) = &watcher {
        watcher.close();
    }
    if let Some(scanner) = &scanner {
        scanner.close();
    }
    if let Some(server) = &mirror_server {
        server.close();
    }
    analysis_pool.wait_closed().await;

    for task in &tasks {
        task.abort();
    }
    for task in tasks {
        let _ = task.await;
    }
    signal_task.abort();

    Ok(())
}

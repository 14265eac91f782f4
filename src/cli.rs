/*
 * Copyright 2026 Google LLC All Rights Reserved.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use eyre::WrapErr;
use futures::Stream;
use kube::runtime::{watcher, WatchStreamExt};
use serde::de::DeserializeOwned;

use crate::{
    admin,
    api::{GameServer, GameServerSet},
    client::KubeClientset,
    config::Config,
    crd,
    gameserversets::Controller,
    informer::Informer,
    signal,
    webhook::WebHook,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(clap::Parser)]
#[command(version, about)]
pub struct Cli {
    #[clap(flatten)]
    pub config: Config,
    #[clap(
        short,
        long,
        env = "AGON_QUIET",
        help = "Whether to suppress logging to stdout/stderr."
    )]
    quiet: bool,
}

impl Cli {
    /// Drives the controller lifecycle: client bootstrap, CRD gate,
    /// informers, admin and webhook endpoints, then the worker pool until
    /// a shutdown signal arrives.
    pub async fn drive(self) -> crate::Result<()> {
        if !self.quiet {
            let env_filter = tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .from_env_lossy();
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(env_filter)
                .init();
        }

        tracing::info!(version = VERSION, "starting gameserverset controller");
        self.config.validate()?;

        let _ = rustls::crypto::ring::default_provider().install_default();

        let (shutdown_tx, shutdown_rx) = signal::spawn_handler();

        let client = tokio::time::timeout(
            Duration::from_secs(5),
            kube::Client::try_default(),
        )
        .await
        .wrap_err("timed out connecting to the cluster")??;

        {
            let mut shutdown = shutdown_rx.clone();
            crd::wait_for_established(
                client.clone(),
                &["gameserversets.agon.dev", "gameservers.agon.dev"],
                &mut shutdown,
            )
            .await?;
        }

        let health = admin::Health::new(shutdown_tx.clone());
        let ready = Arc::new(AtomicBool::new(false));
        let mut webhook = WebHook::default();
        let allocation_mutex = Arc::new(tokio::sync::Mutex::new(()));

        let mut gameservers = Informer::<GameServer>::new();
        let mut gameserversets = Informer::<GameServerSet>::new();

        let controller = Controller::new(
            &mut webhook,
            &health,
            allocation_mutex,
            KubeClientset::new(client.clone()),
            &mut gameservers,
            &mut gameserversets,
            self.config.resync(),
            shutdown_rx.clone(),
        );

        // readiness flips once both caches have synced
        tokio::spawn({
            let gameservers = gameservers.view();
            let gameserversets = gameserversets.view();
            let ready = ready.clone();
            let mut shutdown = shutdown_rx.clone();
            async move {
                if gameservers.wait_for_sync(&mut shutdown).await
                    && gameserversets.wait_for_sync(&mut shutdown).await
                {
                    ready.store(true, Ordering::SeqCst);
                }
            }
        });

        tokio::spawn({
            let address = self.config.admin_address;
            let health = health.clone();
            let ready = ready.clone();
            let shutdown = shutdown_rx.clone();
            async move {
                if let Err(error) = admin::server(address, health, ready, shutdown).await {
                    tracing::error!(%error, "admin endpoint failed");
                }
            }
        });

        tokio::spawn({
            let address = self.config.webhook_address;
            let shutdown = shutdown_rx.clone();
            async move {
                if let Err(error) = webhook.run(address, shutdown).await {
                    tracing::error!(%error, "admission webhook endpoint failed");
                }
            }
        });

        tokio::spawn({
            let stream =
                watch_stream::<GameServer>(client.clone(), self.config.namespace.as_deref());
            let shutdown = shutdown_rx.clone();
            let shutdown_tx = shutdown_tx.clone();
            async move {
                if let Err(error) = gameservers.run(stream, shutdown).await {
                    tracing::error!(%error, "gameserver informer failed");
                    let _ = shutdown_tx.send(());
                }
            }
        });

        tokio::spawn({
            let stream =
                watch_stream::<GameServerSet>(client.clone(), self.config.namespace.as_deref());
            let shutdown = shutdown_rx.clone();
            let shutdown_tx = shutdown_tx.clone();
            async move {
                if let Err(error) = gameserversets.run(stream, shutdown).await {
                    tracing::error!(%error, "gameserverset informer failed");
                    let _ = shutdown_tx.send(());
                }
            }
        });

        controller.run(self.config.workers).await?;

        tracing::info!("shut down gameserverset controller");
        Ok(())
    }
}

fn watch_stream<K>(
    client: kube::Client,
    namespace: Option<&str>,
) -> impl Stream<Item = Result<watcher::Event<K>, watcher::Error>>
where
    K: kube::Resource<DynamicType = (), Scope = kube::core::NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + std::fmt::Debug
        + Send
        + 'static,
{
    let api: kube::Api<K> = match namespace {
        Some(namespace) => kube::Api::namespaced(client, namespace),
        None => kube::Api::all(client),
    };

    watcher(api, watcher::Config::default()).default_backoff()
}

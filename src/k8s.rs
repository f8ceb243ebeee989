//! Kubernetes client construction.

use anyhow::{Context, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

/// Builds a client: with an explicit kubeconfig path when given (optionally
/// overriding the API server URL), otherwise inferring in-cluster or local
/// configuration.
pub async fn client(apiserver: Option<&str>, kubeconfig: Option<&str>) -> Result<Client> {
    match kubeconfig {
        None => Client::try_default()
            .await
            .context("inferring kube configuration"),
        Some(path) => {
            let kc = Kubeconfig::read_from(path)
                .with_context(|| format!("reading kubeconfig {path}"))?;
            let mut config = Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                .await
                .context("loading kubeconfig")?;
            if let Some(url) = apiserver {
                config.cluster_url = url.parse().context("parsing apiserver url")?;
            }
            Client::try_from(config).context("building kube client")
        }
    }
}

use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to kubeconfig, for running a worker outside the cluster
    #[clap(short, long)]
    pub kubeconfig: Option<String>,
    /// Url to apiserver, blank to read from kubeconfig
    #[clap(short, long)]
    pub apiserver: Option<String>,
}

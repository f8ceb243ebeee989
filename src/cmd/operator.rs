use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to kubeconfig, if absent the in-cluster config is used
    #[clap(short, long)]
    pub kubeconfig: Option<String>,
    /// Url to apiserver, blank to read from kubeconfig
    #[clap(short, long)]
    pub apiserver: Option<String>,
}

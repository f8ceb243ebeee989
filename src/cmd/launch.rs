use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to a MapReduceJob document (JSON)
    #[clap(short, long)]
    pub jobfile: String,
    /// Address the coordination server listens on
    #[clap(short, long, default_value = "0.0.0.0:8989")]
    pub listen: String,
    /// Hostname or IP workers reach this process at (defaults to $MY_POD_IP)
    #[clap(long)]
    pub advertise: Option<String>,
    /// Seconds before the job is abandoned as timed out
    #[clap(short, long, default_value_t = 3600)]
    pub timeout: u64,
    /// Path to kubeconfig, if absent the in-cluster config is used
    #[clap(short, long)]
    pub kubeconfig: Option<String>,
    /// Url to apiserver, blank to read from kubeconfig
    #[clap(short, long)]
    pub apiserver: Option<String>,
}

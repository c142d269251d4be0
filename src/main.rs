fn main() -> anyhow::Result<()> {
    akasha_client::cli::run()
}

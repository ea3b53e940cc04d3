fn main() -> anyhow::Result<()> {
    datafit::run()
}

use netprobe::error::AppResult;

fn main() -> AppResult<()> {
    netprobe::entry::run()
}

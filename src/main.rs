use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    parloir::cli::main()
}

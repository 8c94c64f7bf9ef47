/*
    img3patch - An IMG3 decrypter, LZSS codec and kernelcache patcher
    Copyright (C) 2024 plzdonthaxme

    This program is free software: you can redistribute it and/or modify
    it under the terms of the GNU General Public License as published by
    the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU General Public License for more details.

    You should have received a copy of the GNU General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

use {
    img3patch::{
        Args,
        Command,
        error::Result,
        keystore::PlistKeyStore,
        ops,
    },
    clap::Parser,
    colored::Colorize,
    env_logger::Env,
    std::process,
};

fn run(args: Args) -> Result<()> {
    let mut store = PlistKeyStore::new(&args.db);
    match args.command {
        Command::Decrypt { device, version, section, output, input } => {
            let (device, version) = ops::resolve_target(&input, device.as_deref(), version.as_deref())?;
            ops::decrypt(&mut store, &input, &device, &version, &section, output.as_deref())?;
        }
        Command::Update { device, build, version, page } => {
            let device = match device {
                Some(d) => d,
                None => ops::infer_page_device(&page)?,
            };
            let build = match build {
                Some(b) => b,
                None => ops::infer_page_build(&page)?,
            };
            ops::update(&mut store, &page, &device, &build, &version)?;
        }
        Command::List { input } => {
            ops::list(&input)?;
        }
        Command::Extract { section, input } => {
            ops::extract(&input, section.as_deref())?;
        }
        Command::Patch { device, version, output, patch_file, input } => {
            let (device, version) = ops::resolve_target(&input, device.as_deref(), version.as_deref())?;
            ops::patch(&mut store, &patch_file, &input, &device, &version, output.as_deref())?;
        }
        Command::Parse { input } => {
            ops::parse(&input)?;
        }
        Command::Decompress { output, input } => {
            ops::decompress(&input, output.as_deref())?;
        }
    }
    Ok(())
}

fn main() {
    let args = Args::parse();
    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    if let Err(e) = run(args) {
        eprintln!("{}", format!("Error: {e}").red());
        process::exit(1);
    }
}

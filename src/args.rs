use std::path::Path;

use clap::{Arg, ArgAction, Command, command, value_parser};

use crate::errors::HprofScopeError;
use crate::errors::HprofScopeError::{InputFileNotFound, InvalidArgument};
use crate::heap::ParsingMode;

#[derive(Debug, Clone)]
pub struct Args {
    pub input_file: String,
    pub top: usize,
    pub compute_dominators: bool,
    pub path_to: Option<u64>,
    pub mode: ParsingMode,
    pub json: bool,
    pub list_strings: bool,
}

fn app() -> Command {
    command!()
        .arg(
            Arg::new("inputFile")
                .help("binary hprof input file")
                .long("input")
                .short('i')
                .required(true),
        )
        .arg(
            Arg::new("top")
                .help("number of rows in the top-N tables")
                .long("top")
                .short('t')
                .default_value("20")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("dominators")
                .help("compute the dominator tree and report retained sizes")
                .long("dominators")
                .short('d')
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("pathTo")
                .help("print the shortest GC-root path to the object with this native id (hex or decimal)")
                .long("path-to")
                .value_name("OBJECT_ID"),
        )
        .arg(
            Arg::new("mode")
                .help("object table mode; auto picks by file size")
                .long("mode")
                .value_parser(["auto", "memory", "indexed"])
                .default_value("auto"),
        )
        .arg(
            Arg::new("json")
                .help("also write the report as a JSON file")
                .long("json")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("listStrings")
                .help("list all UTF-8 strings found in the dump")
                .long("list-strings")
                .short('l')
                .action(ArgAction::SetTrue),
        )
}

fn parse_native_id(raw: &str) -> Result<u64, HprofScopeError> {
    let parsed = if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        raw.parse::<u64>()
    };
    parsed.map_err(|_| InvalidArgument {
        message: format!("'{raw}' is not a valid object id"),
    })
}

pub fn get_args() -> Result<Args, HprofScopeError> {
    let matches = app().try_get_matches()?;

    let input_file = matches
        .get_one::<String>("inputFile")
        .expect("argument is required")
        .trim()
        .to_string();
    if !Path::new(&input_file).is_file() {
        return Err(InputFileNotFound { name: input_file });
    }

    let top = *matches.get_one::<usize>("top").expect("argument has default");
    if top == 0 {
        return Err(InvalidArgument {
            message: "--top must be a positive integer".to_string(),
        });
    }

    let path_to = matches
        .get_one::<String>("pathTo")
        .map(|raw| parse_native_id(raw))
        .transpose()?;

    let mode = match matches
        .get_one::<String>("mode")
        .expect("argument has default")
        .as_str()
    {
        "memory" => ParsingMode::InMemory,
        "indexed" => ParsingMode::Indexed,
        _ => ParsingMode::Auto,
    };

    Ok(Args {
        input_file,
        top,
        compute_dominators: matches.get_flag("dominators"),
        path_to,
        mode,
        json: matches.get_flag("json"),
        list_strings: matches.get_flag("listStrings"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_app() {
        app().debug_assert();
    }

    #[test]
    fn native_ids_parse_in_both_radixes() {
        assert_eq!(parse_native_id("42").unwrap(), 42);
        assert_eq!(parse_native_id("0x2a").unwrap(), 42);
        assert_eq!(parse_native_id("0X2A").unwrap(), 42);
        assert!(parse_native_id("forty-two").is_err());
    }
}

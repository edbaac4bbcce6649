use clap::{ArgMatches, CommandFactory, FromArgMatches};

use crate::error::{AppError, AppResult};

use super::AgentArgs;

pub(crate) fn parse_test_args<I, T>(args: I) -> AppResult<(AgentArgs, ArgMatches)>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let matches = AgentArgs::command()
        .try_get_matches_from(args)
        .map_err(AppError::from)?;
    let args = AgentArgs::from_arg_matches(&matches)?;
    Ok((args, matches))
}

mod file;
mod parse;
mod service;

pub(crate) use self::{
  file::{ConfigFormat, EXAMPLE_CONFIG, load_config, parse_config, render_config},
  parse::{Invocation, parse_opts},
  service::ConfigReloader,
};

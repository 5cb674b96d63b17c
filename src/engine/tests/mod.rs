mod helpers;
mod tests_layers;
mod tests_properties;

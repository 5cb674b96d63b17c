mod helpers;
mod tests_persistence;

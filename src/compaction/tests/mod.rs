mod helpers;
mod tests_leveled;
mod tests_merge;

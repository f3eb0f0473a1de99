pub(crate) mod async_task;

pub(crate) mod backoff;

#[cfg(test)]
mod utils_test;

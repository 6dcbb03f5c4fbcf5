mod helpers;
mod semaphore_tests;

mod decryptor_tests;
mod helpers;
mod storage_tests;

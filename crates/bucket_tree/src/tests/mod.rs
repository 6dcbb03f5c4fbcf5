mod helpers;
mod visitor_tests;

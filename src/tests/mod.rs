mod matching;
mod support;
mod web;

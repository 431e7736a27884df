pub mod mp3;

use federation::logic::codec::CodecKey;
use shared::error::CommonError;

pub fn cmd_generate_key() -> Result<(), CommonError> {
    let key = CodecKey::generate()?;
    println!("{}", key.to_base64());
    Ok(())
}

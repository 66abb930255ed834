use tokenizers::Tokenizer;

/// Tokenizes `prompt`, replacing every occurrence of `image_token` with
/// `image_token_id`.
///
/// Each text chunk is encoded on its own, so each may start with BOS. Only the
/// leading BOS survives: "<image>\nDescribe" becomes
/// `[bos, image_token_id, ...tokens for "\nDescribe"]`.
pub(crate) fn tokenize_with_image_token(
    tokenizer: &Tokenizer,
    prompt: &str,
    image_token: &str,
    image_token_id: i64,
    bos_token_id: i64,
) -> anyhow::Result<Vec<i64>> {
    let chunks = prompt
        .split(image_token)
        .map(|chunk| {
            let encoding = tokenizer.encode(chunk, true).map_err(anyhow::Error::msg)?;
            Ok(encoding.get_ids().iter().map(|id| *id as i64).collect())
        })
        .collect::<anyhow::Result<Vec<Vec<i64>>>>()?;

    Ok(join_with_image_token(chunks, image_token_id, bos_token_id))
}

pub(crate) fn join_with_image_token(
    chunks: Vec<Vec<i64>>,
    image_token_id: i64,
    bos_token_id: i64,
) -> Vec<i64> {
    let starts_with_bos = chunks.first().and_then(|c| c.first()) == Some(&bos_token_id);
    let offset = usize::from(starts_with_bos);

    let mut input_ids = Vec::new();
    if starts_with_bos {
        input_ids.push(bos_token_id);
    }

    let separator = vec![image_token_id; offset + 1];
    let count = chunks.len();
    for (index, chunk) in chunks.into_iter().enumerate() {
        input_ids.extend(chunk.into_iter().skip(offset));
        if index + 1 < count {
            input_ids.extend(separator.iter().skip(offset));
        }
    }
    input_ids
}

#[test]
fn test_join_with_bos() {
    // "<image>\nDescribe" encoded as ["", "\nDescribe"], each with a leading bos
    let chunks = vec![vec![1], vec![1, 13, 20]];
    assert_eq!(join_with_image_token(chunks, 32000, 1), vec![1, 32000, 13, 20]);
}

#[test]
fn test_join_without_bos() {
    let chunks = vec![vec![5, 6], vec![7], vec![8]];
    assert_eq!(
        join_with_image_token(chunks, 99, 1),
        vec![5, 6, 99, 7, 99, 8]
    );
}

#[test]
fn test_join_without_image_token() {
    let chunks = vec![vec![1, 4, 5]];
    assert_eq!(join_with_image_token(chunks, 99, 1), vec![1, 4, 5]);
}
